//! Retry-with-checkpoint execution of single agents.

pub mod classify;
pub mod executor;

pub use classify::{ErrorKind, VALIDATION_FAILED, backoff_delay, classify};
pub use executor::{
    AttemptObserver, AttemptReport, NoopObserver, RetryExecutor, UnitRunner, Validator, WorkUnit,
};
