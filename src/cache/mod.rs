//! Local caches that let reads succeed without the network.
//!
//! - `StatusCache`: per-day status of tracked entities, final states never re-fetched
//! - `AppliedStateCache`: in-progress selections isolated per parent context
//! - `StatusReader`: cache-first reads with offline fallback

mod applied;
mod layer;
mod status;
mod traits;

pub use applied::{AppliedStateCache, ContextKey};
pub use layer::{RemoteStatus, StatusReader};
pub use status::{CachedStatusEntry, StatusCache, StatusKey, VisitStatus, DEFAULT_RETENTION_DAYS};
pub use traits::{CacheResult, CacheSource};
