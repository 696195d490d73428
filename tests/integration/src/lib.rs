//! Test harness for running several orbweave core states in one process.
//!
//! Every collaborator the core state needs (discovery, consensus, log,
//! state machine, database, snapshot transfer) has a small in-memory
//! stand-in here. Nodes share a [`Discovery`] so they can bind to the same
//! cluster, and a joining node can download its snapshot straight from a
//! running peer.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use orbweave_cluster::{
    ClusterId, ClusterTopology, ConsensusEngine, ConsensusError, ConsensusOutcome, CoreConfig,
    CoreSnapshot, CoreState, CoreStateKind, CoreStateParts, DatabaseError, InFlightCache,
    InMemoryRaftLog, LocalDatabase, LogEntry, MemberId, RaftLog, RaftMessage, SnapshotDownloader,
    SnapshotError, StateMachine, StateMachineError, TopologyService,
};

/// Discovery state shared by every node of a test cluster.
#[derive(Default)]
pub struct Discovery {
    agreed: Mutex<Option<ClusterId>>,
    members: Mutex<Vec<MemberId>>,
}

impl Discovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn agreed(&self) -> Option<ClusterId> {
        *self.agreed.lock().unwrap()
    }

    /// Pretends the cluster already agreed on `id`.
    pub fn force_agreed(&self, id: ClusterId) {
        *self.agreed.lock().unwrap() = Some(id);
    }

    /// The view one node gets. Only views created with `may_bootstrap`
    /// are allowed to originate a cluster.
    pub fn view(self: &Arc<Self>, member: MemberId, may_bootstrap: bool) -> Arc<DiscoveryView> {
        self.members.lock().unwrap().push(member);
        Arc::new(DiscoveryView {
            discovery: Arc::clone(self),
            may_bootstrap,
        })
    }
}

pub struct DiscoveryView {
    discovery: Arc<Discovery>,
    may_bootstrap: bool,
}

impl TopologyService for DiscoveryView {
    fn current_topology(&self) -> ClusterTopology {
        ClusterTopology {
            cluster_id: self.discovery.agreed(),
            can_be_bootstrapped: self.may_bootstrap,
            members: self.discovery.members.lock().unwrap().clone(),
        }
    }

    fn publish_cluster_id(&self, id: ClusterId) -> bool {
        let mut agreed = self.discovery.agreed.lock().unwrap();
        // first writer wins, like a compare-and-set in a real discovery service
        *agreed.get_or_insert(id) == id
    }
}

/// Consensus stand-in that replays queued outcomes.
#[derive(Default)]
pub struct ScriptedEngine {
    outcomes: Mutex<VecDeque<Result<ConsensusOutcome, String>>>,
    timers_stopped: AtomicBool,
}

impl ScriptedEngine {
    pub fn push(&self, outcome: ConsensusOutcome) {
        self.outcomes.lock().unwrap().push_back(Ok(outcome));
    }

    pub fn push_failure(&self, reason: &str) {
        self.outcomes.lock().unwrap().push_back(Err(reason.to_owned()));
    }

    pub fn timers_stopped(&self) -> bool {
        self.timers_stopped.load(Ordering::SeqCst)
    }
}

impl ConsensusEngine for ScriptedEngine {
    fn handle(&self, _message: RaftMessage) -> Result<ConsensusOutcome, ConsensusError> {
        match self.outcomes.lock().unwrap().pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(reason)) => Err(ConsensusError::Failed(reason)),
            None => Ok(ConsensusOutcome::committed(-1)),
        }
    }

    fn stop_timers(&self) {
        self.timers_stopped.store(true, Ordering::SeqCst);
    }

    fn term(&self) -> u64 {
        1
    }

    fn append_index(&self) -> i64 {
        -1
    }
}

/// Key-value state machine: every command is `key=value`.
#[derive(Default)]
pub struct KvMachine {
    data: Mutex<BTreeMap<String, String>>,
    applied: Mutex<Vec<i64>>,
}

impl KvMachine {
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    pub fn applied(&self) -> Vec<i64> {
        self.applied.lock().unwrap().clone()
    }
}

impl StateMachine for KvMachine {
    fn apply(&self, index: i64, entry: &LogEntry) -> Result<(), StateMachineError> {
        let text = std::str::from_utf8(&entry.content)
            .map_err(|e| StateMachineError(format!("command is not utf-8: {e}")))?;
        let (key, value) = text
            .split_once('=')
            .ok_or_else(|| StateMachineError(format!("malformed command {text:?}")))?;
        self.data.lock().unwrap().insert(key.into(), value.into());
        self.applied.lock().unwrap().push(index);
        Ok(())
    }

    fn snapshot_parts(&self) -> Result<BTreeMap<CoreStateKind, Bytes>, StateMachineError> {
        let encoded = self
            .data
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("\n");
        let mut parts = BTreeMap::new();
        parts.insert(CoreStateKind::RaftCoreState, Bytes::from(encoded));
        Ok(parts)
    }

    fn install_parts(&self, snapshot: &CoreSnapshot) -> Result<(), StateMachineError> {
        let mut data = self.data.lock().unwrap();
        data.clear();
        if let Some(part) = snapshot.get(CoreStateKind::RaftCoreState) {
            let text = std::str::from_utf8(part).map_err(|e| StateMachineError(e.to_string()))?;
            for line in text.lines().filter(|l| !l.is_empty()) {
                if let Some((k, v)) = line.split_once('=') {
                    data.insert(k.into(), v.into());
                }
            }
        }
        Ok(())
    }
}

/// Records lifecycle calls in order.
#[derive(Default)]
pub struct RecordingDatabase {
    events: Mutex<Vec<String>>,
}

impl RecordingDatabase {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn panicked(&self) -> bool {
        self.events().iter().any(|e| e.starts_with("panic"))
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl LocalDatabase for RecordingDatabase {
    fn start(&self) -> Result<(), DatabaseError> {
        self.record("start");
        Ok(())
    }

    fn stop(&self) -> Result<(), DatabaseError> {
        self.record("stop");
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DatabaseError> {
        self.record("shutdown");
        Ok(())
    }

    fn panic(&self, reason: &str) {
        self.record(format!("panic: {reason}"));
    }
}

/// Downloads snapshots from whichever peer has been registered.
#[derive(Default)]
pub struct PeerDownloader {
    peers: Mutex<BTreeMap<MemberId, Arc<CoreState>>>,
}

impl PeerDownloader {
    pub fn register(&self, member: MemberId, core: Arc<CoreState>) {
        self.peers.lock().unwrap().insert(member, core);
    }
}

impl SnapshotDownloader for PeerDownloader {
    fn download(&self, source: MemberId) -> Result<CoreSnapshot, SnapshotError> {
        let peer = self
            .peers
            .lock()
            .unwrap()
            .get(&source)
            .cloned()
            .ok_or_else(|| SnapshotError::Transfer {
                source_member: source,
                reason: "unknown peer".into(),
            })?;
        peer.snapshot().map_err(|e| SnapshotError::Transfer {
            source_member: source,
            reason: e.to_string(),
        })
    }
}

/// One in-process node and handles to all of its collaborators.
pub struct TestNode {
    pub member: MemberId,
    pub state_dir: PathBuf,
    pub core: Arc<CoreState>,
    pub engine: Arc<ScriptedEngine>,
    pub log: Arc<InMemoryRaftLog>,
    pub cache: Arc<InFlightCache>,
    pub machine: Arc<KvMachine>,
    pub database: Arc<RecordingDatabase>,
}

/// Options for [`TestNode::new`].
pub struct NodeOptions<'a> {
    pub discovery: &'a Arc<Discovery>,
    pub downloader: Arc<PeerDownloader>,
    pub may_bootstrap: bool,
    pub first_snapshot_timeout_secs: u64,
}

impl TestNode {
    /// Builds a node over `state_dir`. Nothing is started.
    pub fn new(state_dir: &Path, member: MemberId, opts: NodeOptions<'_>) -> Self {
        let config = CoreConfig {
            state_dir: state_dir.to_path_buf(),
            binding_timeout_secs: 5,
            binding_retry_ms: 10,
            first_snapshot_timeout_secs: opts.first_snapshot_timeout_secs,
            applier_stuck_warning_secs: 1,
            state_rotation_entries: 4,
            flush_every: 2,
        };
        let engine = Arc::new(ScriptedEngine::default());
        let log = Arc::new(InMemoryRaftLog::new());
        let cache = Arc::new(InFlightCache::new());
        let machine = Arc::new(KvMachine::default());
        let database = Arc::new(RecordingDatabase::default());

        let core = CoreState::new(
            &config,
            CoreStateParts {
                topology: opts.discovery.view(member, opts.may_bootstrap),
                engine: Arc::clone(&engine) as Arc<dyn ConsensusEngine>,
                log: Arc::clone(&log) as Arc<dyn RaftLog>,
                cache: Arc::clone(&cache),
                state_machine: Arc::clone(&machine) as Arc<dyn StateMachine>,
                database: Arc::clone(&database) as Arc<dyn LocalDatabase>,
                downloader: opts.downloader,
            },
        )
        .unwrap_or_else(|e| panic!("failed to build core state: {e}"));

        Self {
            member,
            state_dir: state_dir.to_path_buf(),
            core: Arc::new(core),
            engine,
            log,
            cache,
            machine,
            database,
        }
    }

    /// Appends `key=value` commands to this node's log, registering each
    /// in the in-flight cache as a leader would.
    pub fn append(&self, commands: &[&str]) -> i64 {
        let mut last = self.log.append_index();
        for command in commands {
            let entry = LogEntry::new(1, command.to_string());
            last = self.log.append(entry.clone());
            self.cache.register(last, entry);
        }
        last
    }

    /// Appends a command at an explicit index, bypassing the cache.
    pub fn insert(&self, index: i64, command: &str) {
        self.log.insert(index, LogEntry::new(1, command.to_string()));
    }

    /// Reports `commit_index` as committed through the consensus path.
    pub fn commit(&self, commit_index: i64) {
        self.engine.push(ConsensusOutcome::committed(commit_index));
        self.core.handle(RaftMessage::new(MemberId::new(), "append"));
    }

    pub fn wait_applied(&self, index: i64) {
        wait_until(|| self.core.last_applied() >= index);
    }
}

/// Polls `cond` until it holds, panicking after five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached within 5 seconds");
        std::thread::sleep(Duration::from_millis(5));
    }
}
