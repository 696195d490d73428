//! End-to-end core state lifecycle across several in-process nodes.

use std::sync::Arc;

use orbweave_cluster::{ConsensusOutcome, Lifecycle, MemberId, RaftMessage};
use orbweave_integration::{wait_until, Discovery, NodeOptions, PeerDownloader, TestNode};

fn options<'a>(
    discovery: &'a Arc<Discovery>,
    downloader: &Arc<PeerDownloader>,
    may_bootstrap: bool,
) -> NodeOptions<'a> {
    NodeOptions {
        discovery,
        downloader: Arc::clone(downloader),
        may_bootstrap,
        first_snapshot_timeout_secs: 10,
    }
}

/// Starts a bootstrapping node with `x=1`, `y=2`, `z=3` applied at 1..=3.
fn bootstrap(dir: &tempfile::TempDir, discovery: &Arc<Discovery>, downloader: &Arc<PeerDownloader>) -> TestNode {
    let node = TestNode::new(dir.path(), MemberId::new(), options(discovery, downloader, true));
    node.core.start().unwrap();
    assert_eq!(node.core.last_applied(), 0, "seed snapshot sits at index 0");

    node.insert(0, "cluster=created");
    let last = node.append(&["x=1", "y=2", "z=3"]);
    assert_eq!(last, 3);
    node.commit(last);
    node.wait_applied(last);
    node
}

#[test]
fn joining_node_catches_up_from_peer_snapshot() {
    let discovery = Discovery::new();
    let downloader = Arc::new(PeerDownloader::default());
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = bootstrap(&dir_a, &discovery, &downloader);
    assert_eq!(a.machine.get("y").as_deref(), Some("2"));
    downloader.register(a.member, Arc::clone(&a.core));

    let b = TestNode::new(dir_b.path(), MemberId::new(), options(&discovery, &downloader, false));
    let core_b = Arc::clone(&b.core);
    let starter = std::thread::spawn(move || core_b.start());
    wait_until(|| b.core.lifecycle() == Lifecycle::WaitingForSnapshot);

    // the leader tells b it is too far behind
    b.engine.push(ConsensusOutcome::snapshot_needed(3));
    b.core.handle(RaftMessage::new(a.member, "append"));
    starter.join().unwrap().unwrap();

    assert_eq!(b.core.lifecycle(), Lifecycle::Running);
    assert_eq!(b.core.last_applied(), 3);
    assert_eq!(b.machine.get("z").as_deref(), Some("3"));
    assert_eq!(b.core.cluster_id(), a.core.cluster_id());
    assert!(b.machine.applied().is_empty(), "caught up without replaying commands");

    // from here on entries replicate normally
    b.insert(4, "x=4");
    b.commit(4);
    b.wait_applied(4);
    assert_eq!(b.machine.get("x").as_deref(), Some("4"));
    assert_eq!(b.machine.applied(), vec![4]);
}

#[test]
fn restart_resumes_after_last_flushed_index() {
    let discovery = Discovery::new();
    let downloader = Arc::new(PeerDownloader::default());
    let dir = tempfile::tempdir().unwrap();

    let cluster_id = {
        let a = bootstrap(&dir, &discovery, &downloader);
        a.core.shutdown().unwrap();
        assert_eq!(a.database.events(), vec!["start", "stop", "shutdown"]);
        a.core.cluster_id()
    };

    let a = TestNode::new(dir.path(), MemberId::new(), options(&discovery, &downloader, true));
    assert_eq!(a.core.last_applied(), 3);
    a.core.start().unwrap();
    assert_eq!(a.core.cluster_id(), cluster_id);
    // no seed snapshot on restart
    assert_eq!(a.core.last_applied(), 3);

    a.insert(4, "w=4");
    a.commit(4);
    a.wait_applied(4);
    assert_eq!(a.machine.applied(), vec![4]);
}

#[test]
fn consensus_failure_takes_node_out_of_service() {
    let discovery = Discovery::new();
    let downloader = Arc::new(PeerDownloader::default());
    let dir = tempfile::tempdir().unwrap();
    let a = bootstrap(&dir, &discovery, &downloader);

    a.engine.push_failure("log corrupted");
    a.core.handle(RaftMessage::new(MemberId::new(), "append"));

    assert!(a.engine.timers_stopped());
    assert!(a.database.panicked());
    let events = a.database.events();
    assert!(events.iter().any(|e| e.contains("log corrupted")), "{events:?}");
}

#[test]
fn commit_beyond_log_panics_database() {
    let discovery = Discovery::new();
    let downloader = Arc::new(PeerDownloader::default());
    let dir = tempfile::tempdir().unwrap();
    let a = bootstrap(&dir, &discovery, &downloader);

    a.commit(10);
    wait_until(|| a.database.panicked());
    assert_eq!(a.core.last_applied(), 3);
    // the consensus side keeps running; only the database is affected
    assert!(!a.engine.timers_stopped());
}

#[test]
fn snapshot_from_unknown_peer_leaves_node_running() {
    let discovery = Discovery::new();
    let downloader = Arc::new(PeerDownloader::default());
    let dir = tempfile::tempdir().unwrap();
    let a = bootstrap(&dir, &discovery, &downloader);

    a.engine.push(ConsensusOutcome::snapshot_needed(50));
    a.core.handle(RaftMessage::new(MemberId::new(), "append"));

    assert_eq!(a.core.lifecycle(), Lifecycle::Running);
    assert_eq!(a.core.last_applied(), 3);
    assert!(!a.database.panicked());

    // application resumes once the download attempt is over
    a.append(&["v=5"]);
    a.commit(4);
    a.wait_applied(4);
    assert_eq!(a.machine.get("v").as_deref(), Some("5"));
}
