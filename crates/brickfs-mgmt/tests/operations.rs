mod common;

use brickfs_mgmt::op_ctx::{GsyncCommand, OpRequest, ProfileCommand};
use brickfs_mgmt::transport::BrickRequest;
use brickfs_mgmt::ErrorKind;
use brickfs_volgen::{ClusterType, VolumeStatus};
use common::{assert_ok, create_volume, Cluster, Fault};
use uuid::Uuid;

fn start(name: &str) -> OpRequest {
    OpRequest::StartVolume {
        name: name.into(),
        force: false,
    }
}

fn stop(name: &str) -> OpRequest {
    OpRequest::StopVolume {
        name: name.into(),
        force: false,
    }
}

fn assert_unlocked(cluster: &Cluster, n: usize) {
    for i in 1..=n {
        assert!(!cluster.node(i).state().op_lock.is_locked(), "node{} still locked", i);
    }
}

#[tokio::test]
async fn test_create_start_stop_across_cluster() {
    let cluster = Cluster::formed(2).await;
    let node1 = cluster.node(1);

    assert_ok(&node1.submit(create_volume("v", ClusterType::Replicate, 2, &["node1:/a", "node2:/b"])).await);
    let id = node1.state().volume("v").unwrap().id;
    assert_eq!(cluster.node(2).state().volume("v").unwrap().id, id);

    assert_ok(&node1.submit(start("v")).await);
    for i in 1..=2 {
        assert_eq!(cluster.node(i).state().volume("v").unwrap().status, VolumeStatus::Started);
    }

    assert_ok(&node1.submit(stop("v")).await);
    let mut terminated: Vec<String> = cluster
        .bricks
        .calls()
        .into_iter()
        .filter(|(_, req)| *req == BrickRequest::Terminate)
        .map(|(brick, _)| brick)
        .collect();
    terminated.sort();
    assert_eq!(terminated, vec!["node1:/a", "node2:/b"]);
    assert_eq!(cluster.node(2).state().volume("v").unwrap().status, VolumeStatus::Stopped);
    assert_unlocked(&cluster, 2);
}

#[tokio::test]
async fn test_stage_rejection_aborts_everywhere() {
    let cluster = Cluster::formed(3).await;
    cluster
        .net
        .inject("node3", "stage-op", Fault::Reject("disk full on node3".into()));

    let reply = cluster
        .node(1)
        .submit(create_volume("v", ClusterType::None, 0, &["node1:/a"]))
        .await;
    assert!(!reply.is_success());
    assert_eq!(reply.op_errstr.as_deref(), Some("disk full on node3"));
    for i in 1..=3 {
        assert!(cluster.node(i).state().volume("v").is_none());
    }
    assert_unlocked(&cluster, 3);
    assert!(cluster.net.sent_to("node3").contains(&"cluster-unlock".to_string()));
}

#[tokio::test]
async fn test_local_stage_error_is_reported() {
    let cluster = Cluster::formed(2).await;
    let reply = cluster.node(1).submit(start("missing")).await;
    assert!(!reply.is_success());
    assert_eq!(reply.op_errno, ErrorKind::Validation.errno());
    assert!(reply.op_errstr.unwrap().contains("missing"));
    assert!(!cluster.net.sent_to("node2").contains(&"commit-op".to_string()));
    assert_unlocked(&cluster, 2);
}

#[tokio::test]
async fn test_commit_timeout_fails_with_peer_name() {
    let cluster = Cluster::formed(2).await;
    cluster.net.inject("node2", "commit-op", Fault::Timeout);

    let reply = cluster
        .node(1)
        .submit(create_volume("v", ClusterType::None, 0, &["node1:/a"]))
        .await;
    assert!(!reply.is_success());
    assert_eq!(reply.op_errno, ErrorKind::Transport.errno());
    assert_eq!(reply.op_errstr.as_deref(), Some("Operation failed on node2"));
    // the coordinator committed before asking its peers
    assert!(cluster.node(1).state().volume("v").is_some());
    assert!(cluster.node(2).state().volume("v").is_none());
    assert_unlocked(&cluster, 2);
}

#[tokio::test]
async fn test_undecodable_stage_reply() {
    let cluster = Cluster::formed(2).await;
    cluster.net.inject("node2", "stage-op", Fault::Decode);

    let reply = cluster
        .node(1)
        .submit(create_volume("v", ClusterType::None, 0, &["node1:/a"]))
        .await;
    assert_eq!(reply.op_errstr.as_deref(), Some("Unable to decode response from node2"));
    assert!(cluster.node(1).state().volume("v").is_none());
}

#[tokio::test]
async fn test_busy_peer_refuses_lock() {
    let cluster = Cluster::formed(2).await;
    let other = Uuid::new_v4();
    cluster.node(2).state().op_lock.lock(other).unwrap();

    let reply = cluster
        .node(1)
        .submit(create_volume("v", ClusterType::None, 0, &["node1:/a"]))
        .await;
    assert!(!reply.is_success());
    assert!(reply
        .op_errstr
        .unwrap()
        .starts_with("Another transaction is in progress"));
    assert!(!cluster.node(1).state().op_lock.is_locked());
    assert_eq!(cluster.node(2).state().op_lock.holder().unwrap().holder, other);
    assert!(!cluster.net.sent_to("node2").contains(&"cluster-unlock".to_string()));
}

#[tokio::test]
async fn test_local_lock_held_fails_fast() {
    let cluster = Cluster::standalone(1);
    let node1 = cluster.node(1);
    node1.state().op_lock.lock(Uuid::new_v4()).unwrap();
    let reply = node1.submit(create_volume("v", ClusterType::None, 0, &["node1:/a"])).await;
    assert_eq!(reply.op_errno, ErrorKind::State.errno());
    assert!(node1.state().volume("v").is_none());
}

#[tokio::test]
async fn test_profile_info_merges_all_bricks() {
    let cluster = Cluster::formed(2).await;
    let node1 = cluster.node(1);
    assert_ok(
        &node1
            .submit(create_volume(
                "v",
                ClusterType::None,
                0,
                &["node1:/a", "node2:/b", "node1:/c", "node2:/d"],
            ))
            .await,
    );
    assert_ok(&node1.submit(start("v")).await);
    let profile = |command| OpRequest::Profile {
        name: "v".into(),
        command,
    };
    assert_ok(&node1.submit(profile(ProfileCommand::Start)).await);

    let reply = node1.submit(profile(ProfileCommand::Info)).await;
    assert_ok(&reply);
    assert_eq!(reply.response["count"], "4");
    assert_eq!(reply.response["volname"], "v");
    let mut bricks: Vec<&str> = (1..=4)
        .map(|i| reply.response[&format!("{}-brick", i)].as_str())
        .collect();
    bricks.sort();
    assert_eq!(bricks, vec!["node1:/a", "node1:/c", "node2:/b", "node2:/d"]);
    for i in 1..=4 {
        assert_eq!(reply.response[&format!("{}-read-count", i)], "7");
    }
}

#[tokio::test]
async fn test_failed_brick_does_not_spare_the_others() {
    let cluster = Cluster::formed(2).await;
    let node1 = cluster.node(1);
    assert_ok(
        &node1
            .submit(create_volume("v", ClusterType::None, 0, &["node1:/a", "node2:/b", "node1:/c"]))
            .await,
    );
    assert_ok(&node1.submit(start("v")).await);

    let commits = |cluster: &Cluster| {
        cluster
            .net
            .sent_to("node2")
            .iter()
            .filter(|r| *r == "commit-op")
            .count()
    };
    let before = commits(&cluster);
    cluster.bricks.fail("node1:/a");
    let reply = node1.submit(stop("v")).await;
    assert!(!reply.is_success());
    assert_eq!(reply.op_errno, ErrorKind::State.errno());
    assert_eq!(reply.op_errstr.as_deref(), Some("brick node1:/a is wedged"));

    let mut terminated: Vec<String> = cluster
        .bricks
        .calls()
        .into_iter()
        .filter(|(_, req)| *req == BrickRequest::Terminate)
        .map(|(brick, _)| brick)
        .collect();
    terminated.sort();
    assert_eq!(terminated, vec!["node1:/a", "node1:/c", "node2:/b"]);

    assert!(cluster.net.sent_to("node2").contains(&"brick-op".to_string()));
    assert_eq!(commits(&cluster), before);
    for i in 1..=2 {
        assert_eq!(cluster.node(i).state().volume("v").unwrap().status, VolumeStatus::Started);
    }
    assert_unlocked(&cluster, 2);
}

#[tokio::test]
async fn test_failed_peer_brick_fails_stop() {
    let cluster = Cluster::formed(2).await;
    let node1 = cluster.node(1);
    assert_ok(&node1.submit(create_volume("v", ClusterType::None, 0, &["node1:/a", "node2:/b"])).await);
    assert_ok(&node1.submit(start("v")).await);

    cluster.bricks.fail("node2:/b");
    let reply = node1.submit(stop("v")).await;
    assert_eq!(reply.op_errstr.as_deref(), Some("brick node2:/b is wedged"));
    let terminated = cluster
        .bricks
        .calls()
        .into_iter()
        .filter(|(_, req)| *req == BrickRequest::Terminate)
        .count();
    assert_eq!(terminated, 2);
    assert_eq!(node1.state().volume("v").unwrap().status, VolumeStatus::Started);
    assert_unlocked(&cluster, 2);
}

#[tokio::test]
async fn test_set_option_replicates() {
    let cluster = Cluster::formed(2).await;
    let node1 = cluster.node(1);
    assert_ok(&node1.submit(create_volume("v", ClusterType::None, 0, &["node1:/a", "node2:/b"])).await);

    let request = OpRequest::SetOption {
        name: "v".into(),
        options: [("ping-timeout".to_string(), "42".to_string())].into_iter().collect(),
        force: false,
    };
    assert_ok(&node1.submit(request).await);
    for i in 1..=2 {
        let vol = cluster.node(i).state().volume("v").unwrap();
        assert_eq!(vol.options["network.ping-timeout"], "42", "node{}", i);
    }

    let reply = node1
        .submit(OpRequest::SetOption {
            name: "v".into(),
            options: [("no-such-option".to_string(), "1".to_string())].into_iter().collect(),
            force: false,
        })
        .await;
    assert!(!reply.is_success());
    assert_eq!(reply.op_errno, ErrorKind::Validation.errno());
    assert!(reply
        .op_errstr
        .unwrap()
        .starts_with("option : no-such-option does not exist"));
    let commits = cluster
        .net
        .sent_to("node2")
        .iter()
        .filter(|r| *r == "commit-op")
        .count();
    // only the successful set reached commit
    assert_eq!(commits, 2);
}

#[tokio::test]
async fn test_sync_restores_volume_from_peer() {
    let cluster = Cluster::formed(2).await;
    let node1 = cluster.node(1);
    assert_ok(&node1.submit(create_volume("v", ClusterType::None, 0, &["node1:/a", "node2:/b"])).await);
    let id = node1.state().volume("v").unwrap().id;

    node1.state().remove_volume("v").unwrap();
    assert!(node1.state().volume("v").is_none());

    let reply = node1
        .submit(OpRequest::Sync {
            hostname: "node2".into(),
            volume: None,
        })
        .await;
    assert_ok(&reply);
    assert_eq!(node1.state().volume("v").unwrap().id, id);

    let reply = node1
        .submit(OpRequest::Sync {
            hostname: "node1".into(),
            volume: None,
        })
        .await;
    assert_eq!(reply.op_errstr.as_deref(), Some("sync from localhost not allowed"));
}

#[tokio::test]
async fn test_geo_replication_session_status() {
    let cluster = Cluster::formed(2).await;
    let node1 = cluster.node(1);
    assert_ok(&node1.submit(create_volume("v", ClusterType::None, 0, &["node1:/a", "node2:/b"])).await);
    assert_ok(&node1.submit(start("v")).await);

    let gsync = |command| OpRequest::GeoReplication {
        master: Some("v".into()),
        slave: Some("/backup/dst".into()),
        command,
    };
    assert_ok(&node1.submit(gsync(GsyncCommand::Start)).await);
    assert!(cluster.node(2).state().volume("v").unwrap().has_gsync_sessions());

    let reply = node1.submit(gsync(GsyncCommand::Status)).await;
    assert_ok(&reply);
    assert_eq!(reply.response["gsync-count"], "1");
    assert_eq!(reply.response["master1"], "v");
    assert_eq!(reply.response["slave1"], "file:///backup/dst");

    let reply = node1.submit(gsync(GsyncCommand::Start)).await;
    assert!(!reply.is_success());
    assert!(reply.op_errstr.unwrap().contains("already started"));

    // a running session blocks a plain stop
    let reply = node1.submit(stop("v")).await;
    assert!(reply.op_errstr.unwrap().contains("geo-replication sessions are active"));
}
