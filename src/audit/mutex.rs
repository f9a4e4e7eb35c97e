use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-run exclusive sections.
///
/// Locks are keyed by run id, so writers for unrelated runs never contend.
/// Entries are dropped once nobody holds or waits on them.
#[derive(Clone, Default)]
pub struct SessionMutex {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Removes the run's entry when the last holder leaves, even on panic.
struct EntryCleanup<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    run_id: &'a str,
    entry: Arc<Mutex<()>>,
}

impl Drop for EntryCleanup<'_> {
    fn drop(&mut self) {
        // Two references left means the map's and ours: no other waiter.
        self.locks
            .remove_if(self.run_id, |_, lock| Arc::ptr_eq(lock, &self.entry) && Arc::strong_count(lock) == 2);
    }
}

impl SessionMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `run_id`.
    pub async fn with_lock<F, Fut, T>(&self, run_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let entry = self
            .locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let cleanup = EntryCleanup {
            locks: &self.locks,
            run_id,
            entry,
        };

        let _held = cleanup.entry.lock().await;
        f().await
    }

    /// Number of runs that currently have holders or waiters.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }
}
