//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use arborfs_meta::{DirPath, LocalCluster, MetaConfig, PinKind, RankId};

/// Test configuration with sensible defaults for fast testing
pub struct TestConfig {
    pub max_active: u32,
    pub standby_count: u32,
    pub beacon_grace_ticks: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            max_active: 2,
            standby_count: 2,
            beacon_grace_ticks: 2,
        }
    }
}

impl TestConfig {
    pub fn meta_config(&self) -> MetaConfig {
        MetaConfig {
            max_active_ranks: self.max_active,
            standby_count: self.standby_count,
            beacon_grace_ticks: self.beacon_grace_ticks,
            settle_max_steps: 50_000,
            ..MetaConfig::default()
        }
    }

    pub fn start(&self) -> LocalCluster {
        LocalCluster::new(self.meta_config()).expect("cluster should start")
    }
}

/// Starts a settled cluster with `max_active` ranks.
pub fn cluster(max_active: u32) -> LocalCluster {
    TestConfig {
        max_active,
        ..TestConfig::default()
    }
    .start()
}

pub fn rank(n: u32) -> RankId {
    RankId::new(n)
}

/// Expected subtree view built from `(path, rank)` pairs.
pub fn view(entries: &[(&str, u32)]) -> Vec<(DirPath, RankId)> {
    let mut v: Vec<_> = entries
        .iter()
        .map(|(p, r)| (DirPath::parse(p).unwrap(), RankId::new(*r)))
        .collect();
    v.sort();
    v
}

/// Sets an export pin and settles.
pub fn pin(cluster: &mut LocalCluster, path: &str, value: &str) {
    cluster.set_pin(path, PinKind::Export, value).unwrap();
    cluster.settle().unwrap();
    cluster.check_single_authority().unwrap();
}

/// Asserts that every listed rank reports exactly `expected`.
pub fn assert_views(cluster: &LocalCluster, ranks: &[u32], expected: &[(&str, u32)]) {
    for r in ranks {
        assert_eq!(
            cluster.subtrees(rank(*r)).unwrap(),
            view(expected),
            "subtree view of rank {}",
            r
        );
    }
}

pub fn owner(cluster: &LocalCluster, path: &str) -> Option<u32> {
    cluster
        .authority_of(path)
        .unwrap()
        .map(|r| r.as_u32())
}
