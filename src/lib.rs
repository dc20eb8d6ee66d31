//! Offline-first local cache and sync queue for field-sales clients.
//!
//! Writes commit locally first and reach the remote record store later,
//! when connectivity allows. Reads are served from local state.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod offline;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod store;
pub mod sync;

pub use error::{RemoteError, StorageError};
pub use offline::{OfflineContext, OfflineSettings, RemoteCommit, WriteReceipt};
