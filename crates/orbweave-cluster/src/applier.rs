//! Single-worker executor for applying committed commands.
//!
//! Applying commands can be slow, so it runs on a dedicated OS thread
//! instead of the thread that delivers consensus messages. Commands must
//! be applied in commit order, so there is exactly one worker.
//!
//! Cancellation is cooperative. Every task is built with the [`Status`]
//! of the current epoch and checks it between units of work. `sync`
//! optionally cancels that status, waits for the worker to drain and exit,
//! and starts a new epoch with a fresh status. Stale tasks keep looking at
//! the old, cancelled token, so nothing ever resets a flag under them.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, warn};

const WORKER_NAME: &str = "orbweave-applier";

/// Cancellation token for one applier epoch.
#[derive(Debug, Clone, Default)]
pub struct Status {
    cancelled: Arc<AtomicBool>,
}

impl Status {
    fn new() -> Self {
        Self::default()
    }

    /// True once the epoch this task belongs to has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    tx: mpsc::Sender<Task>,
    done: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let (done_tx, done) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    // a failing task must not take the queued ones with it
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("applier task panicked");
                    }
                }
                let _ = done_tx.send(());
            })?;
        Ok(Self { tx, done, handle })
    }

    /// Closes the queue and blocks until the worker has run everything
    /// already queued and exited. Warns every `warn_every` while waiting.
    fn shutdown(self, warn_every: Duration) {
        let Worker { tx, done, handle } = self;
        drop(tx);

        let mut waited = Duration::ZERO;
        loop {
            match done.recv_timeout(warn_every) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    waited += warn_every;
                    warn!(?waited, "still waiting for the applier to finish");
                }
            }
        }
        if handle.join().is_err() {
            error!("applier worker exited abnormally");
        }
    }
}

struct ApplierInner {
    worker: Option<Worker>,
    status: Status,
}

/// Cancellable single-thread executor for command application.
pub struct CoreStateApplier {
    inner: Mutex<ApplierInner>,
    stuck_warning: Duration,
}

impl std::fmt::Debug for CoreStateApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreStateApplier")
            .field("stuck_warning", &self.stuck_warning)
            .finish_non_exhaustive()
    }
}

impl CoreStateApplier {
    /// Creates an applier. The worker thread starts with the first
    /// submission. `stuck_warning` is how often `sync` logs while it waits.
    pub fn new(stuck_warning: Duration) -> Self {
        Self {
            inner: Mutex::new(ApplierInner {
                worker: None,
                status: Status::new(),
            }),
            stuck_warning: stuck_warning.max(Duration::from_millis(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ApplierInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Builds a task from the current status and queues it on the worker.
    ///
    /// Submissions are never dropped: if the current status is already
    /// cancelled the task is still queued, and it is up to the task to
    /// notice.
    pub fn submit<F, T>(&self, factory: F) -> io::Result<()>
    where
        F: FnOnce(Status) -> T,
        T: FnOnce() + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.status.is_cancelled() {
            warn!("submitting work to a cancelled applier");
        }
        let task: Task = Box::new(factory(inner.status.clone()));

        let worker = match inner.worker.take() {
            Some(worker) => worker,
            None => Worker::spawn()?,
        };
        let worker = inner.worker.insert(worker);
        worker
            .tx
            .send(task)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "applier worker is gone"))
    }

    /// Waits until no application work is running.
    ///
    /// With `cancel_tasks`, running and queued tasks are told to stop via
    /// their status first. Either way, every queued task gets to run (and
    /// may return early) before the worker exits. Afterwards a fresh,
    /// uncancelled status is in place for new submissions.
    pub fn sync(&self, cancel_tasks: bool) {
        let mut inner = self.lock();
        if cancel_tasks {
            inner.status.cancel();
        }
        if let Some(worker) = inner.worker.take() {
            worker.shutdown(self.stuck_warning);
        }
        inner.status = Status::new();
    }
}
