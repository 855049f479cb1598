//! The background worker thread.
//!
//! All backends and all D-Bus I/O live on a single dedicated thread running a
//! current-thread tokio runtime. The thread starts lazily when the first
//! backend is created and runs until [`shutdown`](crate::shutdown) is called;
//! it restarts automatically if the library is used again afterwards.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime;
use tracing::{debug, warn};

use crate::WORKER_SHUTDOWN_TIMEOUT;

struct Worker {
    handle: runtime::Handle,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

static WORKER: OnceLock<Mutex<Option<Worker>>> = OnceLock::new();

fn slot() -> MutexGuard<'static, Option<Worker>> {
    WORKER
        .get_or_init(|| Mutex::new(None))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the worker runtime, starting the thread if needed.
pub(crate) fn handle() -> runtime::Handle {
    let mut worker = slot();
    if let Some(worker) = worker.as_ref() {
        return worker.handle.clone();
    }
    let started = start();
    let handle = started.handle.clone();
    *worker = Some(started);
    handle
}

fn start() -> Worker {
    let (handle_tx, handle_rx) = std::sync::mpsc::channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let thread = std::thread::Builder::new()
        .name("buscache-worker".to_string())
        .spawn(move || {
            let rt = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build the worker runtime");
            if handle_tx.send(rt.handle().clone()).is_err() {
                return;
            }
            rt.block_on(async {
                let _ = shutdown_rx.await;
            });
            // dropping the runtime cancels all remaining backend tasks
        })
        .expect("failed to spawn the worker thread");
    let handle = handle_rx.recv().expect("worker thread failed to start");
    debug!("worker thread started");
    Worker {
        handle,
        shutdown_tx,
        thread,
    }
}

/// Stop the worker: drain the idle backend cache, signal the runtime to exit,
/// and wait up to [`WORKER_SHUTDOWN_TIMEOUT`] for the thread.
pub(crate) fn shutdown() {
    crate::backend::drain_idle();
    let Some(worker) = slot().take() else {
        return;
    };
    let _ = worker.shutdown_tx.send(());
    let deadline = Instant::now() + WORKER_SHUTDOWN_TIMEOUT;
    while !worker.thread.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                "worker thread did not stop within {:?}, leaving it detached",
                WORKER_SHUTDOWN_TIMEOUT
            );
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = worker.thread.join();
    debug!("worker thread stopped");
}
