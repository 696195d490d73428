//! Applying committed commands to the local state machine.
//!
//! Commit notifications arrive on the consensus thread and only record how
//! far the log is committed. The actual work runs on the
//! [`CoreStateApplier`] worker, which reads entries through an
//! [`InFlightLogEntryReader`] and applies them strictly in index order.
//! Progress is flushed to a [`DurableStateStorage`] so a restart resumes
//! after the last flushed index instead of from scratch.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use orbweave_persistence::DurableStateStorage;
use tracing::{debug, error, info};

use crate::applier::{CoreStateApplier, Status};
use crate::database::LocalDatabase;
use crate::error::{ApplicationError, StateMachineError};
use crate::log::{InFlightCache, InFlightLogEntryReader, LogEntry, RaftLog};
use crate::snapshot::{CoreSnapshot, CoreStateKind};
use crate::state::{LastFlushedState, StateKind};

/// The replicated state the committed commands act on.
pub trait StateMachine: Send + Sync {
    /// Applies the command committed at `index`. Called once per index,
    /// in increasing order.
    fn apply(&self, index: i64, entry: &LogEntry) -> Result<(), StateMachineError>;

    /// Serializes the current state into snapshot parts.
    fn snapshot_parts(&self) -> Result<BTreeMap<CoreStateKind, Bytes>, StateMachineError>;

    /// Replaces the current state with the one in `snapshot`.
    fn install_parts(&self, snapshot: &CoreSnapshot) -> Result<(), StateMachineError>;
}

/// Collaborators of [`CommandApplicationProcess`].
pub struct ApplicationParts {
    pub state_machine: Arc<dyn StateMachine>,
    pub log: Arc<dyn RaftLog>,
    pub cache: Arc<InFlightCache>,
    pub database: Arc<dyn LocalDatabase>,
}

/// State shared between the consensus thread and the applier worker.
struct Shared {
    state_machine: Arc<dyn StateMachine>,
    log: Arc<dyn RaftLog>,
    cache: Arc<InFlightCache>,
    database: Arc<dyn LocalDatabase>,
    flushed: Mutex<DurableStateStorage<LastFlushedState>>,
    last_applied: AtomicI64,
    flush_every: u64,
    panicked: AtomicBool,
}

impl Shared {
    fn last_applied(&self) -> i64 {
        self.last_applied.load(Ordering::Acquire)
    }

    fn flushed(&self) -> MutexGuard<'_, DurableStateStorage<LastFlushedState>> {
        self.flushed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self) -> Result<(), ApplicationError> {
        let index = self.last_applied();
        self.flushed().persist(&LastFlushedState { index })?;
        debug!(index, "flushed applied index");
        Ok(())
    }

    /// Applies everything after the current last-applied index up to
    /// `commit_index`. Runs on the applier worker.
    fn apply_batch(&self, status: &Status, commit_index: i64) {
        if self.panicked.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.apply_range(status, commit_index) {
            error!(error = %e, "failed to apply committed commands");
            self.panicked.store(true, Ordering::Release);
            self.database.panic(&e.to_string());
        }
    }

    fn apply_range(&self, status: &Status, commit_index: i64) -> Result<(), ApplicationError> {
        let mut reader = InFlightLogEntryReader::new(self.log.as_ref(), &self.cache, true);
        let mut unflushed = 0u64;

        let mut index = self.last_applied() + 1;
        while index <= commit_index {
            if status.is_cancelled() {
                debug!(index, commit_index, "apply batch cancelled");
                break;
            }
            let entry = reader
                .get(index)?
                .ok_or(ApplicationError::MissingEntry(index))?;
            self.state_machine
                .apply(index, &entry)
                .map_err(|source| ApplicationError::StateMachine { index, source })?;
            self.last_applied.store(index, Ordering::Release);

            unflushed += 1;
            if unflushed >= self.flush_every {
                self.flush()?;
                unflushed = 0;
            }
            index += 1;
        }
        reader.close();

        if unflushed > 0 {
            self.flush()?;
        }
        Ok(())
    }
}

/// What has been handed to the applier.
#[derive(Debug)]
struct Queue {
    /// Highest index already handed to the applier.
    last_queued: i64,
    /// Set while a snapshot is collected or installed; nothing is queued
    /// until it clears.
    held: bool,
}

/// Feeds committed commands to the state machine on the applier worker.
pub struct CommandApplicationProcess {
    applier: CoreStateApplier,
    shared: Arc<Shared>,
    commit_index: AtomicI64,
    queue: Mutex<Queue>,
    /// Serializes snapshot collection and installation.
    exclusive: Mutex<()>,
    started: AtomicBool,
}

impl std::fmt::Debug for CommandApplicationProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandApplicationProcess")
            .field("last_applied", &self.last_applied())
            .field("commit_index", &self.commit_index.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl CommandApplicationProcess {
    /// Opens the flushed-index store under `state_dir` and seeds the
    /// last applied index from it.
    pub fn new(
        state_dir: &Path,
        rotation: u64,
        flush_every: u64,
        stuck_warning: Duration,
        parts: ApplicationParts,
    ) -> Result<Self, ApplicationError> {
        let mut flushed = DurableStateStorage::<LastFlushedState>::open(
            state_dir,
            StateKind::LastFlushed.name(),
            rotation,
        )?;
        let last_applied = flushed
            .take_initial_state()
            .map_or(-1, |state| state.index);
        info!(last_applied, "recovered last flushed index");

        let shared = Arc::new(Shared {
            state_machine: parts.state_machine,
            log: parts.log,
            cache: parts.cache,
            database: parts.database,
            flushed: Mutex::new(flushed),
            last_applied: AtomicI64::new(last_applied),
            flush_every: flush_every.max(1),
            panicked: AtomicBool::new(false),
        });

        Ok(Self {
            applier: CoreStateApplier::new(stuck_warning),
            shared,
            commit_index: AtomicI64::new(last_applied),
            queue: Mutex::new(Queue {
                last_queued: last_applied,
                held: false,
            }),
            exclusive: Mutex::new(()),
            started: AtomicBool::new(false),
        })
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drains the applier and keeps it idle until the guard is passed to
    /// [`release`](Self::release). Commits reported meanwhile are recorded
    /// and queued on release.
    fn hold(&self, cancel: bool) -> MutexGuard<'_, ()> {
        let exclusive = self.exclusive.lock().unwrap_or_else(|e| e.into_inner());
        self.queue().held = true;
        self.pause(cancel);
        exclusive
    }

    fn release(&self, _exclusive: MutexGuard<'_, ()>) -> Result<(), ApplicationError> {
        self.queue().held = false;
        self.schedule()
    }

    /// Highest index applied to the state machine, `-1` if none.
    pub fn last_applied(&self) -> i64 {
        self.shared.last_applied()
    }

    /// Highest index reported committed so far.
    pub fn commit_index(&self) -> i64 {
        self.commit_index.load(Ordering::Acquire)
    }

    /// Starts applying. Commits reported before this are applied now.
    pub fn start(&self) -> Result<(), ApplicationError> {
        self.started.store(true, Ordering::Release);
        info!(last_applied = self.last_applied(), "command application started");
        self.schedule()
    }

    /// Records that the log is committed up to `commit_index` and queues
    /// the new entries for application. Never waits for them to apply.
    pub fn notify_committed(&self, commit_index: i64) -> Result<(), ApplicationError> {
        self.commit_index.fetch_max(commit_index, Ordering::AcqRel);
        self.schedule()
    }

    fn schedule(&self) -> Result<(), ApplicationError> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut queue = self.queue();
        let commit_index = self.commit_index();
        if queue.held || commit_index <= queue.last_queued {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        self.applier.submit(move |status| {
            move || shared.apply_batch(&status, commit_index)
        })?;
        queue.last_queued = commit_index;
        Ok(())
    }

    /// Waits for in-progress application, optionally cancelling it.
    /// Nothing new is applied until [`resume`](Self::resume) or a snapshot
    /// install schedules it again.
    pub fn pause(&self, cancel: bool) {
        self.applier.sync(cancel);
        self.queue().last_queued = self.last_applied();
    }

    /// Queues whatever was committed but not yet applied.
    pub fn resume(&self) -> Result<(), ApplicationError> {
        self.schedule()
    }

    /// Collects a snapshot of everything applied so far.
    ///
    /// Drains the applier first so the parts and `prev_index` agree.
    pub fn snapshot(&self, term: u64) -> Result<CoreSnapshot, ApplicationError> {
        let exclusive = self.hold(false);
        let parts = self.shared.state_machine.snapshot_parts();
        let prev_index = self.last_applied();
        self.release(exclusive)?;

        let parts = parts.map_err(ApplicationError::Snapshot)?;
        Ok(CoreSnapshot::with_parts(prev_index, term, parts))
    }

    /// Replaces the local state with `snapshot`, cancelling any
    /// application work in progress.
    ///
    /// No batch runs between the drain and the flush of the new index;
    /// commits reported meanwhile are applied after the install.
    pub fn install_snapshot(&self, snapshot: &CoreSnapshot) -> Result<(), ApplicationError> {
        let exclusive = self.hold(true);
        let installed = self.install_held(snapshot);
        let scheduled = self.release(exclusive);
        installed?;
        scheduled
    }

    fn install_held(&self, snapshot: &CoreSnapshot) -> Result<(), ApplicationError> {
        self.shared
            .state_machine
            .install_parts(snapshot)
            .map_err(ApplicationError::Snapshot)?;

        let index = snapshot.prev_index;
        self.shared.last_applied.store(index, Ordering::Release);
        self.queue().last_queued = index;
        self.commit_index.fetch_max(index, Ordering::AcqRel);
        self.shared.panicked.store(false, Ordering::Release);
        self.shared.flush()?;
        info!(prev_index = index, prev_term = snapshot.prev_term, "installed snapshot");
        Ok(())
    }

    /// Stops applying after the queued work has drained, and flushes the
    /// final applied index.
    pub fn stop(&self) -> Result<(), ApplicationError> {
        self.started.store(false, Ordering::Release);
        self.pause(false);
        self.shared.flush()?;
        info!(last_applied = self.last_applied(), "command application stopped");
        Ok(())
    }
}
