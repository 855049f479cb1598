//! Asynchronous, shared, per-thread-consistent caching of D-Bus properties.
//!
//! Generated client stubs read remote properties with blocking calls and
//! ignore the `PropertiesChanged` signal. [`PropertyCache`] replaces that
//! pattern: it keeps one authoritative copy of a remote interface's property
//! set per target (bus + service + path + interface) for the whole process,
//! projects it into per-thread views that are safe to read synchronously, and
//! delivers change notifications in a strict order with a hard guarantee that
//! readers never observe a partially applied update.
//!
//! # Architecture
//!
//! ```text
//! D-Bus ──> Backend ──────> ThreadView ─────> PropertyCache(s) ──> application
//!          (worker thread:  (per thread,      (per handle,
//!           GetAll, signals, queued delivery)  direct calls)
//!           owner watch)
//! ```
//!
//! One worker thread owns every backend and all D-Bus I/O. Client threads run
//! their own event loops (a current-thread tokio runtime with a
//! [`tokio::task::LocalSet`]) and receive updates through queued delivery;
//! reads never lock and never touch the wire.
//!
//! # Example
//!
//! ```no_run
//! use buscache::PropertyCache;
//!
//! let cache = PropertyCache::with_session(
//!     "org.example.Daemon",
//!     "/org/example/Daemon",
//!     "org.example.Daemon",
//! );
//! cache.on_event(|event| println!("{event:?}"));
//! cache.initialize();
//! ```

use std::time::Duration;

mod backend;
mod cache;
mod error;
mod target;
mod value;
mod view;
mod worker;

pub mod adaptor;
pub mod transport;

pub use cache::{CacheEvent, PropertyCache};
pub use error::{BusError, ErrorKind};
pub use target::{Bus, Target};
pub use value::{FromValue, PropertyMap, Value};

/// Number of released backends kept alive for quick reuse.
pub const IDLE_CACHE_CAPACITY: usize = 5;

/// Delay before loading properties after a service gains an owner, giving
/// the peer time to finish starting up.
pub const SERVICE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// How long [`shutdown`] waits for the worker thread.
pub const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tear down the shared worker: destroy idle backends, stop the worker
/// runtime, and wait up to [`WORKER_SHUTDOWN_TIMEOUT`] for its thread.
///
/// Call this before process exit to drain background work cleanly. Caches
/// created afterwards restart the worker transparently.
pub fn shutdown() {
    worker::shutdown();
}
