//! Binding a node to a cluster identity.
//!
//! Before any replicated data can be trusted, every node has to agree on
//! which cluster it belongs to. [`BindingProcess`] decides, from one view
//! of the topology and the locally stored id, whether the node can bind
//! now. [`BindingService`] polls the topology until that decision is made,
//! persists the result, and publishes it when this node may bootstrap.
//!
//! Only the topology collaborator decides who may bootstrap. The binding
//! logic only decides which id to propose once bootstrapping is allowed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use orbweave_persistence::SimpleStorage;
use tracing::{debug, info, warn};

use crate::error::BindingError;
use crate::state::StateKind;
use crate::topology::{ClusterTopology, TopologyService};
use crate::ClusterId;

/// Pure decision step of binding.
pub struct BindingProcess;

impl BindingProcess {
    /// Decides which cluster id to bind to, given the current topology and
    /// the id stored locally (if any).
    ///
    /// Returns `Ok(None)` when no decision is possible yet and the caller
    /// should retry later. Minting a fresh id happens only when the
    /// topology has no agreed id, the visible members may bootstrap, and
    /// nothing is stored locally.
    pub fn attempt(
        topology: &ClusterTopology,
        local: Option<ClusterId>,
    ) -> Result<Option<ClusterId>, BindingError> {
        if let Some(discovered) = topology.cluster_id() {
            return match local {
                None => Ok(Some(discovered)),
                Some(local) if local == discovered => Ok(Some(discovered)),
                Some(local) => Err(BindingError::Mismatch { local, discovered }),
            };
        }

        if topology.can_be_bootstrapped() {
            // re-proposing a previously minted id keeps a half-finished
            // bootstrap stable across restarts
            return Ok(Some(local.unwrap_or_else(ClusterId::new)));
        }

        Ok(None)
    }
}

/// Source of the current time for the binding deadline.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Pause between two topology polls.
pub trait RetryWait: Send + Sync {
    fn wait(&self);
}

/// Sleeps the calling thread for a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct SleepRetry {
    pub interval: Duration,
}

impl RetryWait for SleepRetry {
    fn wait(&self) {
        std::thread::sleep(self.interval);
    }
}

/// Drives [`BindingProcess`] to a durable, published result.
pub struct BindingService {
    storage: SimpleStorage<ClusterId>,
    topology: Arc<dyn TopologyService>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    retry: Arc<dyn RetryWait>,
    bootstrapped: AtomicBool,
}

impl std::fmt::Debug for BindingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingService")
            .field("storage", &self.storage.path())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BindingService {
    /// Creates a binding service storing the cluster id under `state_dir`.
    ///
    /// Polls the topology every `retry_interval` until `timeout` elapses.
    pub fn new(
        state_dir: &Path,
        topology: Arc<dyn TopologyService>,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            storage: SimpleStorage::new(state_dir, StateKind::ClusterId.name()),
            topology,
            timeout,
            clock: Arc::new(SystemClock),
            retry: Arc::new(SleepRetry {
                interval: retry_interval,
            }),
            bootstrapped: AtomicBool::new(false),
        }
    }

    /// Replaces the clock and the wait between polls.
    pub fn with_timing(mut self, clock: Arc<dyn Clock>, retry: Arc<dyn RetryWait>) -> Self {
        self.clock = clock;
        self.retry = retry;
        self
    }

    /// Blocks until the node is bound to a cluster.
    ///
    /// A newly agreed id is durably stored before this returns. When the
    /// visible members may bootstrap, the id is also published; failing to
    /// publish is fatal.
    pub fn bind_to_cluster(&self) -> Result<ClusterId, BindingError> {
        let local = self.storage.read()?;
        let started = self.clock.now();
        let deadline = started + self.timeout;

        let mut attempts = 0u64;
        let (cluster_id, topology) = loop {
            let topology = self.topology.current_topology();
            if let Some(id) = BindingProcess::attempt(&topology, local)? {
                break (id, topology);
            }
            attempts += 1;
            if self.clock.now() >= deadline {
                warn!(attempts, "gave up waiting for cluster topology");
                return Err(BindingError::Timeout(self.timeout));
            }
            debug!(attempts, "cluster topology not yet decidable, retrying");
            self.retry.wait();
        };

        if local.is_none() {
            self.storage.write(&cluster_id)?;
        }
        // a stored id re-proposed to an undecided cluster is still ours to
        // bootstrap, e.g. after a crash before the first state was installed
        let bootstrapping = topology.cluster_id().is_none();
        self.bootstrapped.store(bootstrapping, Ordering::Release);

        if topology.can_be_bootstrapped() && !self.topology.publish_cluster_id(cluster_id) {
            return Err(BindingError::PublishFailed(cluster_id));
        }

        info!(%cluster_id, attempts, "bound to cluster");
        Ok(cluster_id)
    }

    /// True if the last successful bind originated the cluster id, either
    /// freshly minted or re-proposed from local storage, rather than
    /// adopting one the cluster had already agreed on.
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// The locally stored cluster id, if any.
    pub fn local_cluster_id(&self) -> Result<Option<ClusterId>, BindingError> {
        Ok(self.storage.read()?)
    }
}
