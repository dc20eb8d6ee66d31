//! Draining the sync queue against the remote store.
//!
//! - [`SyncEngine`] runs one drain: in queue order, one request per key at a
//!   time, with timeouts and backoff.
//! - [`spawn_scheduler`] decides when drains happen.

mod backoff;
mod engine;
mod scheduler;

pub use backoff::Backoff;
pub use engine::{Rejection, SyncEngine, SyncReport, SyncSettings};
pub use scheduler::{spawn_scheduler, Lifecycle, SchedulerHandle};

pub(crate) use engine::{remote_visit_status, visit_status};
