//! Node-level control of the replicated core state.
//!
//! [`CoreState`] ties the pieces together: it binds the node to a cluster,
//! makes sure there is some state to start from (a seed snapshot when this
//! node bootstrapped the cluster, or the first snapshot downloaded from a
//! peer), then turns every consensus outcome into either a snapshot
//! download or a commit notification for the applier.
//!
//! `handle` runs on the consensus thread and never fails outward: if the
//! consensus engine errors or panics, the node leaves leadership and voting
//! and the local database is marked unhealthy.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::application::{ApplicationParts, CommandApplicationProcess, StateMachine};
use crate::binding::{BindingService, Clock, RetryWait};
use crate::config::CoreConfig;
use crate::consensus::{ConsensusEngine, RaftMessage};
use crate::database::LocalDatabase;
use crate::error::CoreStateError;
use crate::log::{InFlightCache, RaftLog};
use crate::snapshot::{CoreSnapshot, SnapshotDownloader};
use crate::topology::TopologyService;
use crate::{ClusterId, MemberId};

/// Where a [`CoreState`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Binding,
    WaitingForSnapshot,
    Running,
    Stopped,
    ShutDown,
}

impl Lifecycle {
    /// True while consensus messages are processed.
    pub fn accepts_messages(self) -> bool {
        matches!(self, Lifecycle::WaitingForSnapshot | Lifecycle::Running)
    }
}

/// Collaborators of a [`CoreState`].
pub struct CoreStateParts {
    pub topology: Arc<dyn TopologyService>,
    pub engine: Arc<dyn ConsensusEngine>,
    pub log: Arc<dyn RaftLog>,
    pub cache: Arc<InFlightCache>,
    pub state_machine: Arc<dyn StateMachine>,
    pub database: Arc<dyn LocalDatabase>,
    pub downloader: Arc<dyn SnapshotDownloader>,
}

/// One-shot gate opened by the first installed snapshot.
#[derive(Debug, Default)]
struct SnapshotLatch {
    installed: Mutex<bool>,
    cond: Condvar,
}

impl SnapshotLatch {
    fn count_down(&self) {
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        *installed = true;
        self.cond.notify_all();
    }

    /// Returns whether a snapshot was installed within `timeout`.
    fn wait(&self, timeout: Duration) -> bool {
        let installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        let (installed, _) = self
            .cond
            .wait_timeout_while(installed, timeout, |installed| !*installed)
            .unwrap_or_else(|e| e.into_inner());
        *installed
    }
}

pub struct CoreState {
    binding: BindingService,
    engine: Arc<dyn ConsensusEngine>,
    application: CommandApplicationProcess,
    downloader: Arc<dyn SnapshotDownloader>,
    database: Arc<dyn LocalDatabase>,
    first_snapshot_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes snapshot downloads.
    snapshot_lock: Mutex<()>,
    latch: SnapshotLatch,
}

impl std::fmt::Debug for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreState")
            .field("lifecycle", &self.lifecycle())
            .field("application", &self.application)
            .finish_non_exhaustive()
    }
}

impl CoreState {
    /// Builds the core state and opens its persisted values under
    /// `config.state_dir`. Nothing runs until [`start`](Self::start).
    pub fn new(config: &CoreConfig, parts: CoreStateParts) -> Result<Self, CoreStateError> {
        let binding = BindingService::new(
            &config.state_dir,
            parts.topology,
            config.binding_timeout(),
            config.binding_retry_interval(),
        );
        let application = CommandApplicationProcess::new(
            &config.state_dir,
            config.state_rotation_entries,
            config.flush_every,
            config.applier_stuck_warning(),
            ApplicationParts {
                state_machine: parts.state_machine,
                log: parts.log,
                cache: parts.cache,
                database: Arc::clone(&parts.database),
            },
        )?;

        Ok(Self {
            binding,
            engine: parts.engine,
            application,
            downloader: parts.downloader,
            database: parts.database,
            first_snapshot_timeout: config.first_snapshot_timeout(),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            snapshot_lock: Mutex::new(()),
            latch: SnapshotLatch::default(),
        })
    }

    /// Replaces the clock and retry wait used while binding.
    pub fn with_binding_timing(mut self, clock: Arc<dyn Clock>, retry: Arc<dyn RetryWait>) -> Self {
        self.binding = self.binding.with_timing(clock, retry);
        self
    }

    fn lifecycle_guard(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        let mut lifecycle = self.lifecycle_guard();
        debug!(from = ?*lifecycle, to = ?next, "core state transition");
        *lifecycle = next;
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle_guard()
    }

    /// Highest index applied to the local state machine, `-1` if none.
    pub fn last_applied(&self) -> i64 {
        self.application.last_applied()
    }

    /// The cluster id stored locally, once bound.
    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.binding.local_cluster_id().ok().flatten()
    }

    /// Binds to the cluster, makes sure there is state to start from, and
    /// starts the database and command application.
    ///
    /// Blocks while binding and, on a node with no applied state that did
    /// not bootstrap the cluster, until a snapshot has been installed
    /// through [`handle`](Self::handle).
    pub fn start(&self) -> Result<(), CoreStateError> {
        self.set_lifecycle(Lifecycle::Binding);
        let cluster_id = self.binding.bind_to_cluster()?;

        if self.binding.bootstrapped() && self.last_applied() <= -1 {
            info!(%cluster_id, "bootstrapping new cluster from seed snapshot");
            self.install_snapshot(&CoreSnapshot::seed())?;
        } else if self.last_applied() <= -1 {
            self.set_lifecycle(Lifecycle::WaitingForSnapshot);
            info!(timeout = ?self.first_snapshot_timeout, "waiting for first snapshot");
            if !self.latch.wait(self.first_snapshot_timeout) {
                error!("no snapshot arrived, cannot start without state");
                return Err(CoreStateError::NoSnapshot(self.first_snapshot_timeout));
            }
        }

        self.database.start()?;
        self.application.start()?;
        self.set_lifecycle(Lifecycle::Running);
        info!(%cluster_id, last_applied = self.last_applied(), "core state running");
        Ok(())
    }

    /// Processes one inbound consensus message.
    ///
    /// Ignored outside the waiting and running phases. Failures are
    /// contained here and never returned.
    pub fn handle(&self, message: RaftMessage) {
        let lifecycle = self.lifecycle();
        if !lifecycle.accepts_messages() {
            warn!(?lifecycle, from = %message.from, "ignoring consensus message");
            return;
        }

        let from = message.from;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.engine.handle(message))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.contain_failure(&e.to_string());
                return;
            }
            Err(payload) => {
                self.contain_failure(&panic_message(payload.as_ref()));
                return;
            }
        };

        if outcome.needs_fresh_snapshot {
            self.download_snapshot(from);
        } else if let Err(e) = self.application.notify_committed(outcome.commit_index) {
            self.contain_failure(&e.to_string());
        }
    }

    fn contain_failure(&self, reason: &str) {
        error!(reason, "consensus handling failed, leaving the cluster");
        self.engine.stop_timers();
        self.database.panic(reason);
    }

    fn snapshot_guard(&self) -> MutexGuard<'_, ()> {
        self.snapshot_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn download_snapshot(&self, source: MemberId) {
        let _guard = self.snapshot_guard();
        info!(%source, "downloading snapshot");
        self.application.pause(true);

        let installed = self
            .downloader
            .download(source)
            .map_err(CoreStateError::from)
            .and_then(|snapshot| {
                self.application.install_snapshot(&snapshot)?;
                Ok(snapshot)
            });
        match installed {
            Ok(snapshot) => {
                self.latch.count_down();
                info!(%source, prev_index = snapshot.prev_index, "snapshot installed");
            }
            Err(e) => {
                error!(%source, error = %e, "failed to download snapshot");
                if let Err(e) = self.application.resume() {
                    self.contain_failure(&e.to_string());
                }
            }
        }
    }

    /// Collects a snapshot of the applied state, pausing application
    /// while the parts are gathered.
    pub fn snapshot(&self) -> Result<CoreSnapshot, CoreStateError> {
        let _guard = self.snapshot_guard();
        Ok(self.application.snapshot(self.engine.term())?)
    }

    /// Replaces the local state with `snapshot`, cancelling application
    /// work in progress.
    pub fn install_snapshot(&self, snapshot: &CoreSnapshot) -> Result<(), CoreStateError> {
        let _guard = self.snapshot_guard();
        self.application.install_snapshot(snapshot)?;
        self.latch.count_down();
        Ok(())
    }

    /// Stops command application and then the database. Messages handled
    /// afterwards are ignored.
    pub fn stop(&self) -> Result<(), CoreStateError> {
        if matches!(self.lifecycle(), Lifecycle::Stopped | Lifecycle::ShutDown) {
            return Ok(());
        }
        self.set_lifecycle(Lifecycle::Stopped);
        self.application.stop()?;
        self.database.stop()?;
        info!("core state stopped");
        Ok(())
    }

    /// Stops, then releases the database for good.
    pub fn shutdown(&self) -> Result<(), CoreStateError> {
        if self.lifecycle() == Lifecycle::ShutDown {
            return Ok(());
        }
        self.stop()?;
        self.database.shutdown()?;
        self.set_lifecycle(Lifecycle::ShutDown);
        info!("core state shut down");
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("consensus engine panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("consensus engine panicked: {msg}")
    } else {
        "consensus engine panicked".to_owned()
    }
}
