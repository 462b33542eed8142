//! Cluster topology: which daemon serves which rank.
//!
//! Tracks the rank → daemon mapping, rank states and the standby pool.
//! A failed rank is taken over by a standby once the beacon grace period has
//! passed; the new daemon has a new gid, which is how peers tell a takeover
//! from a slow rank. Changes are emitted as [`TopologyEvent`]s for the ranks
//! to consume.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{DaemonGid, MetaError, RankId};

/// State of a rank slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RankState {
    /// Serving and joinable.
    Active,
    /// A daemon is replaying the journal and resolving.
    StandbyReplay,
    /// No daemon assigned yet.
    Standby,
    /// The daemon died; waiting for takeover.
    Failed,
    /// Shedding its subtrees before leaving.
    Stopping,
}

impl fmt::Display for RankState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RankState::Active => "up:active",
            RankState::StandbyReplay => "up:replay",
            RankState::Standby => "up:standby",
            RankState::Failed => "down:failed",
            RankState::Stopping => "up:stopping",
        };
        write!(f, "{}", s)
    }
}

/// The daemon currently holding a rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankIdentity {
    /// Rank slot
    pub rank: RankId,
    /// Daemon serving it
    pub gid: DaemonGid,
    /// Current state
    pub state: RankState,
}

/// Topology change delivered to ranks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A rank's daemon died.
    RankFailed {
        /// Rank slot
        rank: RankId,
        /// The dead daemon
        gid: DaemonGid,
    },
    /// A rank became active, possibly under a new daemon.
    RankUp {
        /// Rank slot
        rank: RankId,
        /// The serving daemon
        gid: DaemonGid,
    },
    /// The number of active ranks changed.
    MaxActive(u32),
    /// A stopping rank finished shedding and left.
    RankStopped(RankId),
}

/// Rank table, standby pool and failure clock.
pub struct ClusterTopology {
    ranks: BTreeMap<RankId, RankIdentity>,
    standbys: VecDeque<DaemonGid>,
    failed_at: BTreeMap<RankId, u64>,
    max_active: u32,
    max_ranks: u32,
    beacon_grace_ticks: u64,
    next_gid: u64,
    events: Vec<TopologyEvent>,
}

impl ClusterTopology {
    /// Creates a topology with `standby_count` idle daemons and no ranks assigned.
    pub fn new(
        max_active: u32,
        standby_count: u32,
        max_ranks: u32,
        beacon_grace_ticks: u64,
    ) -> Result<Self, MetaError> {
        if max_active == 0 || max_active > max_ranks {
            return Err(MetaError::ConfigError(format!(
                "max_active {} must be within 1..={}",
                max_active, max_ranks
            )));
        }
        let mut topology = Self {
            ranks: BTreeMap::new(),
            standbys: VecDeque::new(),
            failed_at: BTreeMap::new(),
            max_active,
            max_ranks,
            beacon_grace_ticks,
            next_gid: 4100,
            events: Vec::new(),
        };
        for _ in 0..standby_count {
            let gid = topology.spawn_daemon();
            topology.standbys.push_back(gid);
        }
        Ok(topology)
    }

    fn spawn_daemon(&mut self) -> DaemonGid {
        let gid = DaemonGid::new(self.next_gid);
        self.next_gid += 1;
        gid
    }

    /// Assigns a freshly started daemon to a new rank slot.
    pub fn create_rank(&mut self, rank: RankId) -> Result<DaemonGid, MetaError> {
        if rank.as_u32() >= self.max_ranks {
            return Err(MetaError::NoSuchRank(rank.as_u32() as i64));
        }
        if self.ranks.contains_key(&rank) {
            return Err(MetaError::AlreadyExists(format!("rank {}", rank)));
        }
        let gid = self.spawn_daemon();
        self.ranks.insert(
            rank,
            RankIdentity {
                rank,
                gid,
                state: RankState::StandbyReplay,
            },
        );
        tracing::info!(%rank, %gid, "rank created");
        Ok(gid)
    }

    /// Assigns a standby daemon to a rank slot that has none.
    pub fn assign_standby(&mut self, rank: RankId) -> Result<DaemonGid, MetaError> {
        if rank.as_u32() >= self.max_ranks {
            return Err(MetaError::NoSuchRank(rank.as_u32() as i64));
        }
        let gid = self
            .standbys
            .pop_front()
            .ok_or(MetaError::RankUnavailable(rank))?;
        self.failed_at.remove(&rank);
        self.ranks.insert(
            rank,
            RankIdentity {
                rank,
                gid,
                state: RankState::StandbyReplay,
            },
        );
        tracing::info!(%rank, %gid, "standby assigned to rank");
        Ok(gid)
    }

    /// Marks a rank active and announces it.
    pub fn mark_active(&mut self, rank: RankId) -> Result<DaemonGid, MetaError> {
        let identity = self
            .ranks
            .get_mut(&rank)
            .ok_or(MetaError::RankUnavailable(rank))?;
        identity.state = RankState::Active;
        let gid = identity.gid;
        self.events.push(TopologyEvent::RankUp { rank, gid });
        Ok(gid)
    }

    /// Marks a rank's daemon dead at tick `now`. The dead daemon does not
    /// rejoin the standby pool; takeover draws on the existing standbys only.
    pub fn mark_failed(&mut self, rank: RankId, now: u64) -> Result<DaemonGid, MetaError> {
        let identity = self
            .ranks
            .get_mut(&rank)
            .ok_or(MetaError::RankUnavailable(rank))?;
        identity.state = RankState::Failed;
        let gid = identity.gid;
        self.failed_at.insert(rank, now);
        self.events.push(TopologyEvent::RankFailed { rank, gid });
        tracing::warn!(%rank, %gid, "rank failed");
        Ok(gid)
    }

    /// Failed ranks whose grace period has passed at tick `now`.
    pub fn takeovers_due(&self, now: u64) -> Vec<RankId> {
        if self.standbys.is_empty() {
            return Vec::new();
        }
        self.failed_at
            .iter()
            .filter(|(_, at)| now.saturating_sub(**at) >= self.beacon_grace_ticks)
            .map(|(rank, _)| *rank)
            .collect()
    }

    /// Changes the number of active ranks.
    pub fn set_max_active(&mut self, max_active: u32) -> Result<(), MetaError> {
        if max_active == 0 || max_active > self.max_ranks {
            return Err(MetaError::NoSuchRank(max_active as i64));
        }
        self.max_active = max_active;
        self.events.push(TopologyEvent::MaxActive(max_active));
        Ok(())
    }

    /// Marks a rank as shedding its subtrees.
    pub fn mark_stopping(&mut self, rank: RankId) -> Result<(), MetaError> {
        let identity = self
            .ranks
            .get_mut(&rank)
            .ok_or(MetaError::RankUnavailable(rank))?;
        identity.state = RankState::Stopping;
        Ok(())
    }

    /// Removes a stopped rank; its daemon returns to the standby pool.
    pub fn remove(&mut self, rank: RankId) -> Result<(), MetaError> {
        let identity = self
            .ranks
            .remove(&rank)
            .ok_or(MetaError::RankUnavailable(rank))?;
        self.failed_at.remove(&rank);
        if identity.state != RankState::Failed {
            self.standbys.push_back(identity.gid);
        }
        self.events.push(TopologyEvent::RankStopped(rank));
        tracing::info!(%rank, gid = %identity.gid, "rank stopped");
        Ok(())
    }

    /// Identity of a rank slot.
    pub fn identity(&self, rank: RankId) -> Option<&RankIdentity> {
        self.ranks.get(&rank)
    }

    /// Daemon serving a rank.
    pub fn gid_of(&self, rank: RankId) -> Option<DaemonGid> {
        self.ranks.get(&rank).map(|i| i.gid)
    }

    /// State of a rank slot.
    pub fn state_of(&self, rank: RankId) -> Option<RankState> {
        self.ranks.get(&rank).map(|i| i.state)
    }

    /// True if `gid` is the live daemon for `rank`.
    pub fn is_current(&self, rank: RankId, gid: DaemonGid) -> bool {
        self.ranks
            .get(&rank)
            .map_or(false, |i| i.gid == gid && i.state != RankState::Failed)
    }

    /// Ranks in the Active state.
    pub fn active_ranks(&self) -> Vec<RankId> {
        self.ranks
            .values()
            .filter(|i| i.state == RankState::Active)
            .map(|i| i.rank)
            .collect()
    }

    /// Every assigned rank slot.
    pub fn identities(&self) -> Vec<RankIdentity> {
        self.ranks.values().cloned().collect()
    }

    /// Ranks waiting for takeover.
    pub fn failed_ranks(&self) -> Vec<RankId> {
        self.failed_at.keys().copied().collect()
    }

    /// Idle daemons.
    pub fn standby_count(&self) -> usize {
        self.standbys.len()
    }

    /// Configured number of active ranks.
    pub fn max_active(&self) -> u32 {
        self.max_active
    }

    /// Hard limit on rank numbers.
    pub fn max_ranks(&self) -> u32 {
        self.max_ranks
    }

    /// Takes the pending events.
    pub fn drain_events(&mut self) -> Vec<TopologyEvent> {
        std::mem::take(&mut self.events)
    }
}
