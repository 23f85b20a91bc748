//! Network interception layer.
//!
//! Every outgoing request is classified and served through one strategy:
//! - static assets are cache-first
//! - API reads are network-first, falling back to the last cached copy or a
//!   local default for critical reads
//! - navigations fall back to a cached page or an offline page
//! - writes and cross-origin requests pass through untouched
//!
//! Cache partitions are versioned by a generation tag; activating a
//! generation deletes every partition it does not own.

mod classify;
mod control;
mod layer;
mod storage;
mod traits;

pub use classify::{Classifier, RequestClass};
pub use control::{spawn_control, ControlClient, ControlRequest, ControlResponse};
pub use layer::{Intercepted, Interceptor};
pub use storage::{CacheStorage, CachedResponse, NoopStorage, SqliteStorage};
pub use traits::{CacheClass, CacheGeneration, CacheResult, CacheSource};
