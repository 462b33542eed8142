//! Integration tests for multi-rank cluster scenarios.
//!
//! These tests drive a whole in-process cluster through pin changes,
//! renames, session migration and rank count changes.

mod common;

use arborfs_meta::topology::RankState;
use arborfs_meta::{ClientId, LocalCluster, MetaError, PinKind};
use common::{assert_views, cluster, owner, pin, rank, TestConfig};

#[test]
fn test_export_pin_sequence() {
    let mut c = cluster(2);
    c.mkdir_p("/1/2/3").unwrap();

    pin(&mut c, "/1", "1");
    assert_views(&c, &[0, 1], &[("/1", 1)]);

    // Pinning a child to the same rank splits off a separate subtree.
    pin(&mut c, "/1/2", "1");
    assert_views(&c, &[0, 1], &[("/1", 1), ("/1/2", 1)]);

    pin(&mut c, "/1/2", "0");
    assert_views(&c, &[0, 1], &[("/1", 1), ("/1/2", 0)]);

    // Rank 2 does not exist yet: the pin is latent.
    pin(&mut c, "/1/2/3", "2");
    assert_views(&c, &[0, 1], &[("/1", 1), ("/1/2", 0)]);

    pin(&mut c, "/1/2", "1");
    assert_views(&c, &[0, 1], &[("/1", 1), ("/1/2", 1)]);

    c.mkdir_p("/1/4/5").unwrap();
    pin(&mut c, "/1/4/5", "1");
    assert_views(&c, &[0, 1], &[("/1", 1), ("/1/2", 1), ("/1/4/5", 1)]);

    pin(&mut c, "/1", "0");
    assert_views(&c, &[0, 1], &[("/1", 0), ("/1/2", 1), ("/1/4/5", 1)]);

    // Unpinning folds /1/2 back into /1.
    pin(&mut c, "/1/2", "-1");
    assert_views(&c, &[0, 1], &[("/1", 0), ("/1/4/5", 1)]);

    // Growing the cluster activates the latent pin.
    c.set_max_active(3).unwrap();
    c.settle().unwrap();
    c.check_single_authority().unwrap();
    assert_views(
        &c,
        &[0, 1, 2],
        &[("/1", 0), ("/1/2/3", 2), ("/1/4/5", 1)],
    );

    assert_eq!(c.export_targets(rank(0)).unwrap(), vec![rank(1), rank(2)]);
    assert_eq!(c.export_targets(rank(1)).unwrap(), vec![rank(0)]);
    assert!(c.export_targets(rank(2)).unwrap().is_empty());
    assert!(c.crashes().is_empty());
}

#[test]
fn test_getfattr_reports_pins() {
    let mut c = cluster(2);
    c.mkdir_p("/1/2").unwrap();

    assert_eq!(c.get_pin("/1", PinKind::Export).unwrap(), "-1");
    pin(&mut c, "/1", "1");
    assert_eq!(c.get_pin("/1", PinKind::Export).unwrap(), "1");
    pin(&mut c, "/1", "0");
    assert_eq!(c.get_pin("/1", PinKind::Export).unwrap(), "0");
    pin(&mut c, "/1/2", "2");
    assert_eq!(c.get_pin("/1/2", PinKind::Export).unwrap(), "2");
}

#[test]
fn test_invalid_pin_refused() {
    let mut c = cluster(2);
    c.mkdir_p("/x").unwrap();

    assert!(c.set_pin("/x", PinKind::Export, "bogus").is_err());
    assert!(c.set_pin("/x", PinKind::Export, "4096").is_err());
    assert!(c.set_pin("/x", PinKind::Random, "1.5").is_err());
    assert_eq!(c.get_pin("/x", PinKind::Export).unwrap(), "-1");

    // Anything below -1 clamps to inherit.
    pin(&mut c, "/x", "-7");
    assert_eq!(c.get_pin("/x", PinKind::Export).unwrap(), "-1");
}

#[test]
fn test_rename_across_boundaries() {
    let mut c = cluster(2);
    c.mkdir_p("/a/b").unwrap();
    c.mkdir_p("/aa/bb").unwrap();
    c.set_pin("/a", PinKind::Export, "1").unwrap();
    c.set_pin("/aa/bb", PinKind::Export, "0").unwrap();
    c.settle().unwrap();
    assert_views(&c, &[0, 1], &[("/a", 1), ("/aa/bb", 0)]);

    // mv /aa /a/b/aa
    c.rename("/aa", "/a/b/aa").unwrap();
    c.settle().unwrap();
    c.check_single_authority().unwrap();

    assert_views(&c, &[0, 1], &[("/a", 1), ("/a/b/aa/bb", 0)]);
    assert_eq!(owner(&c, "/a/b/aa"), Some(1));
    assert_eq!(owner(&c, "/a/b/aa/bb"), Some(0));
}

#[test]
fn test_rename_refused_while_frozen() {
    let mut c = cluster(2);
    c.mkdir_p("/busy/inner").unwrap();
    c.mkdir_p("/elsewhere").unwrap();
    c.set_pin("/busy", PinKind::Export, "1").unwrap();

    // Run the export until the subtree is frozen on the exporter.
    let mut frozen = false;
    for _ in 0..100 {
        c.step().unwrap();
        let status = c.rank(rank(0)).unwrap().status();
        if status.subtrees.iter().any(|b| b.frozen) {
            frozen = true;
            break;
        }
    }
    assert!(frozen, "export never froze its subtree");
    assert!(c.rename("/busy/inner", "/elsewhere/inner").is_err());

    c.settle().unwrap();
    c.rename("/busy/inner", "/elsewhere/inner").unwrap();
    assert_eq!(owner(&c, "/elsewhere/inner"), Some(0));
}

#[test]
fn test_create_refused_while_frozen() {
    let mut c = cluster(2);
    c.mkdir_p("/busy/inner").unwrap();
    c.export_dir("/busy", 1).unwrap();

    let mut frozen = false;
    for _ in 0..100 {
        c.step().unwrap();
        let status = c.rank(rank(0)).unwrap().status();
        if status.subtrees.iter().any(|b| b.frozen) {
            frozen = true;
            break;
        }
    }
    assert!(frozen, "export never froze its subtree");
    assert!(c.mkdir_p("/busy/inner/new").is_err());
    assert!(c.mkdir_p("/busy/other").is_err());
    // Existing directories and creates outside the subtree are unaffected.
    c.mkdir_p("/busy/inner").unwrap();
    c.mkdir_p("/elsewhere/new").unwrap();

    c.settle().unwrap();
    c.mkdir_p("/busy/inner/new").unwrap();
    assert_eq!(owner(&c, "/busy/inner/new"), Some(1));
    assert_eq!(owner(&c, "/elsewhere/new"), Some(0));
}

#[test]
fn test_sessions_follow_subtree() {
    let mut c = cluster(2);
    c.mkdir_p("/home/alice").unwrap();
    let client = ClientId::new(7);
    c.open_session(client, "/home/alice").unwrap();
    c.settle().unwrap();
    assert_eq!(
        c.session_servers(client, "/home/alice").unwrap(),
        vec![rank(0)]
    );

    pin(&mut c, "/home", "1");
    assert_eq!(
        c.session_servers(client, "/home/alice").unwrap(),
        vec![rank(1)]
    );

    // A new client is forwarded to the authority.
    let late = ClientId::new(8);
    c.open_session(late, "/home/alice").unwrap();
    c.settle().unwrap();
    assert_eq!(c.session_servers(late, "/home/alice").unwrap(), vec![rank(1)]);
}

#[test]
fn test_session_out_of_hops_reports_drop() {
    let mut config = TestConfig::default().meta_config();
    config.max_session_hops = 0;
    let mut c = LocalCluster::new(config).unwrap();
    c.mkdir_p("/far").unwrap();
    pin(&mut c, "/far", "1");

    // Rank 0 would have to forward to rank 1 but has no hops to spend.
    let client = ClientId::new(9);
    c.open_session(client, "/far").unwrap();
    c.settle().unwrap();
    let err = c.session_servers(client, "/far").unwrap_err();
    assert!(matches!(err, MetaError::SessionDropped { hops: 0, .. }));
    assert_eq!(c.rank(rank(0)).unwrap().status().dropped_sessions, 1);

    c.mkdir_p("/near").unwrap();
    c.open_session(client, "/near").unwrap();
    c.settle().unwrap();
    assert_eq!(c.session_servers(client, "/near").unwrap(), vec![rank(0)]);
}

#[test]
fn test_session_race_does_not_crash_importer() {
    let mut c = cluster(2);
    c.mkdir_p("/a").unwrap();
    let early = ClientId::new(1);
    let late = ClientId::new(2);
    c.open_session(early, "/a").unwrap();
    c.settle().unwrap();

    c.set_session_race(true).unwrap();
    // The importer dies after logging the import, so the exporter forwards
    // new sessions into a pending subtree.
    c.arm_kill_point(rank(1), None, Some(6)).unwrap();
    c.set_pin("/a", PinKind::Export, "1").unwrap();
    for _ in 0..1000 {
        if c.rank(rank(1)).is_none() {
            break;
        }
        c.step().unwrap();
    }
    assert!(c.rank(rank(1)).is_none(), "importer never hit its kill point");
    c.open_session(late, "/a").unwrap();
    c.settle().unwrap();
    c.check_single_authority().unwrap();

    let gid = c.gid(rank(1)).unwrap();
    assert_eq!(owner(&c, "/a"), Some(1));
    assert_eq!(c.session_servers(early, "/a").unwrap(), vec![rank(1)]);
    // Held back on the importer until the race is cleared.
    assert!(c.session_servers(late, "/a").unwrap().is_empty());
    assert_eq!(c.rank(rank(1)).unwrap().status().queued_sessions, 1);

    c.set_session_race(false).unwrap();
    c.settle().unwrap();
    assert_eq!(c.session_servers(late, "/a").unwrap(), vec![rank(1)]);
    assert_eq!(c.gid(rank(1)), Some(gid));
    assert_eq!(c.crashes().len(), 1);
}

#[test]
fn test_crossing_exports_both_complete() {
    let mut c = cluster(2);
    c.mkdir_p("/a/g").unwrap();
    pin(&mut c, "/a/g", "1");

    // Rank 0 exports /a while rank 1 exports /a/g, in the same balancing pass.
    c.set_pin("/a", PinKind::Export, "1").unwrap();
    c.set_pin("/a/g", PinKind::Export, "0").unwrap();
    c.settle().unwrap();
    c.check_single_authority().unwrap();

    assert_eq!(owner(&c, "/a"), Some(1));
    assert_eq!(owner(&c, "/a/g"), Some(0));
    assert_views(&c, &[0, 1], &[("/a", 1), ("/a/g", 0)]);
    assert!(c.crashes().is_empty());
}

#[test]
fn test_standby_takeover_keeps_authority() {
    let mut c = cluster(2);
    c.mkdir_p("/abc/def").unwrap();
    pin(&mut c, "/abc", "1");
    let before = c.gid(rank(1)).unwrap();

    c.fail_rank(rank(1)).unwrap();
    assert_eq!(c.rank_state(rank(1)), Some(RankState::Failed));
    c.settle().unwrap();
    c.check_single_authority().unwrap();

    assert_ne!(c.gid(rank(1)).unwrap(), before);
    assert_eq!(c.rank_state(rank(1)), Some(RankState::Active));
    assert_eq!(owner(&c, "/abc/def"), Some(1));
    assert_views(&c, &[0, 1], &[("/abc", 1)]);
}

#[test]
fn test_failure_without_standby_waits() {
    let mut c = TestConfig {
        standby_count: 0,
        ..TestConfig::default()
    }
    .start();
    c.fail_rank(rank(1)).unwrap();
    for _ in 0..10 {
        c.tick().unwrap();
    }
    assert_eq!(c.rank_state(rank(1)), Some(RankState::Failed));
    assert!(!c.is_quiescent());
    assert!(c.settle().is_err());
}

#[test]
fn test_shrink_sheds_subtrees() {
    let mut c = cluster(2);
    c.mkdir_p("/a/b").unwrap();
    pin(&mut c, "/a", "1");
    assert_eq!(owner(&c, "/a/b"), Some(1));

    c.set_max_active(1).unwrap();
    c.settle().unwrap();
    c.check_single_authority().unwrap();

    assert!(c.rank(rank(1)).is_none());
    assert_eq!(c.rank_state(rank(1)), None);
    assert_eq!(owner(&c, "/a/b"), Some(0));
    // The pin to rank 1 is latent again, so /a merged back into the root.
    assert_views(&c, &[0], &[]);
    assert_eq!(c.get_pin("/a", PinKind::Export).unwrap(), "1");
}

#[test]
fn test_grow_after_shrink() {
    let mut c = cluster(2);
    c.mkdir_p("/a").unwrap();
    pin(&mut c, "/a", "1");
    c.set_max_active(1).unwrap();
    c.settle().unwrap();
    assert_eq!(owner(&c, "/a"), Some(0));

    c.set_max_active(2).unwrap();
    c.settle().unwrap();
    c.check_single_authority().unwrap();
    assert_eq!(owner(&c, "/a"), Some(1));
    assert_views(&c, &[0, 1], &[("/a", 1)]);
}

#[test]
fn test_grow_requires_standby() {
    let mut c = TestConfig {
        max_active: 1,
        standby_count: 0,
        ..TestConfig::default()
    }
    .start();
    assert!(c.set_max_active(2).is_err());
}

#[test]
fn test_distributed_pin_spreads_children() {
    let mut c = cluster(2);
    for d in ["/home/a", "/home/b", "/home/c", "/home/d", "/home/e", "/home/f"] {
        c.mkdir_p(d).unwrap();
    }
    c.set_pin("/home", PinKind::Distributed, "1").unwrap();
    c.settle().unwrap();
    c.check_single_authority().unwrap();

    let owners: Vec<u32> = ["/home/a", "/home/b", "/home/c", "/home/d", "/home/e", "/home/f"]
        .iter()
        .map(|d| owner(&c, d).unwrap())
        .collect();
    assert!(owners.iter().all(|r| *r < 2));
    // Every child is its own subtree, wherever it landed.
    assert_eq!(c.subtrees(rank(0)).unwrap().len(), 6);
    assert_eq!(c.subtrees(rank(1)).unwrap().len(), 6);

    // Placement is a pure function of the child: a second settle moves nothing.
    let before = c.subtrees(rank(0)).unwrap();
    c.settle().unwrap();
    assert_eq!(c.subtrees(rank(0)).unwrap(), before);
}

#[tokio::test]
async fn test_cluster_on_blocking_pool() {
    // The cluster is Send, so the binary can drive it off the runtime's workers.
    let c = tokio::task::spawn_blocking(|| {
        let mut c = cluster(2);
        c.mkdir_p("/srv").unwrap();
        pin(&mut c, "/srv", "1");
        c
    })
    .await
    .unwrap();

    assert_eq!(owner(&c, "/srv"), Some(1));
    let status = c.status();
    assert_eq!(status.max_active, 2);
    assert_eq!(status.daemons.len(), 2);
    assert_eq!(status.in_flight, 0);
    let json = serde_json::to_string(&status).unwrap();
    assert!(json.contains("\"max_active\":2"));
}
