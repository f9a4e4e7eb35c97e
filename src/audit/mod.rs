//! Per-run audit trail: serialized, durable writes to the workflow log and
//! session metadata.

pub mod log;
pub mod mutex;
pub mod session;

pub use log::AppendLog;
pub use mutex::SessionMutex;
pub use session::{AuditSession, EventKind, SessionMetadata, format_line};
