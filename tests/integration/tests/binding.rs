//! Cluster binding between independently started nodes.

use std::sync::Arc;
use std::time::Duration;

use orbweave_cluster::{
    load_or_create_member_id, BindingError, BindingService, ClusterId, CoreStateError, MemberId,
};
use orbweave_integration::{Discovery, NodeOptions, PeerDownloader, TestNode};

fn binding_service(dir: &std::path::Path, discovery: &Arc<Discovery>, may_bootstrap: bool) -> BindingService {
    BindingService::new(
        dir,
        discovery.view(MemberId::new(), may_bootstrap),
        Duration::from_millis(200),
        Duration::from_millis(10),
    )
}

#[test]
fn founders_agree_on_first_published_id() {
    let discovery = Discovery::new();
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();

    let ids: Vec<ClusterId> = dirs
        .iter()
        .map(|dir| binding_service(dir.path(), &discovery, true).bind_to_cluster().unwrap())
        .collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(discovery.agreed(), Some(ids[0]));
}

#[test]
fn only_the_minting_node_reports_bootstrap() {
    let discovery = Discovery::new();
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();

    let first = binding_service(first_dir.path(), &discovery, true);
    first.bind_to_cluster().unwrap();
    let second = binding_service(second_dir.path(), &discovery, false);
    second.bind_to_cluster().unwrap();

    assert!(first.bootstrapped());
    assert!(!second.bootstrapped());
}

#[test]
fn node_without_bootstrap_rights_times_out_alone() {
    let discovery = Discovery::new();
    let dir = tempfile::tempdir().unwrap();

    let err = binding_service(dir.path(), &discovery, false)
        .bind_to_cluster()
        .unwrap_err();
    assert!(matches!(err, BindingError::Timeout(_)));
    assert_eq!(discovery.agreed(), None);
}

#[test]
fn node_from_another_cluster_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = Arc::new(PeerDownloader::default());

    {
        let first_cluster = Discovery::new();
        let node = TestNode::new(
            dir.path(),
            MemberId::new(),
            NodeOptions {
                discovery: &first_cluster,
                downloader: Arc::clone(&downloader),
                may_bootstrap: true,
                first_snapshot_timeout_secs: 1,
            },
        );
        node.core.start().unwrap();
        node.core.shutdown().unwrap();
    }

    let other = Discovery::new();
    other.force_agreed(ClusterId::new());
    let node = TestNode::new(
        dir.path(),
        MemberId::new(),
        NodeOptions {
            discovery: &other,
            downloader,
            may_bootstrap: false,
            first_snapshot_timeout_secs: 1,
        },
    );

    let err = node.core.start().unwrap_err();
    assert!(
        matches!(err, CoreStateError::Binding(BindingError::Mismatch { .. })),
        "{err}"
    );
    assert!(node.database.events().is_empty());
}

#[test]
fn member_id_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = load_or_create_member_id(dir.path()).unwrap();
    assert_eq!(load_or_create_member_id(dir.path()).unwrap(), id);
}
