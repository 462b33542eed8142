//! In-process cluster driver.
//!
//! Owns the namespace, the topology, one [`Rank`] per live daemon, each
//! rank's journal medium and the message bus. Everything runs on the
//! caller's thread: [`LocalCluster::step`] delivers one message,
//! [`LocalCluster::tick`] advances the clock, and [`LocalCluster::settle`]
//! alternates the two until nothing is left to do.
//!
//! A handler that trips a kill point or fails to write its journal takes its
//! daemon down with it: the rank object is dropped, its journal medium
//! survives, and a standby replays it once the grace period passes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::MetaConfig;
use crate::failpoint::{FailureInjector, KillPointInjector, NoopInjector};
use crate::journal::{FileJournalStore, JournalStore, MemoryJournalStore};
use crate::messages::RankMessage;
use crate::namespace::{read_namespace, write_namespace, DirPath, Namespace, SharedNamespace};
use crate::pin::{apply_pin, format_pin, parse_pin, PinKind};
use crate::rank::{Rank, RankStatus};
use crate::recovery::RankStart;
use crate::session::SessionRequest;
use crate::topology::{ClusterTopology, RankIdentity, RankState};
use crate::transport::{Envelope, MessageBus, Source};
use crate::types::{ClientId, DaemonGid, DirId, MetaError, RankId};

/// A daemon that died.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CrashRecord {
    /// Rank it served
    pub rank: RankId,
    /// The dead daemon
    pub gid: DaemonGid,
    /// Tick of death
    pub tick: u64,
    /// What killed it
    pub reason: String,
}

/// Status of the whole cluster.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterStatus {
    /// Current tick
    pub tick: u64,
    /// Configured active ranks
    pub max_active: u32,
    /// Idle daemons
    pub standbys: usize,
    /// Rank table
    pub ranks: Vec<RankIdentity>,
    /// Per-daemon detail
    pub daemons: Vec<RankStatus>,
    /// Daemons lost so far
    pub crashes: Vec<CrashRecord>,
    /// Messages on the bus
    pub in_flight: usize,
    /// Client messages waiting for a rank to come back
    pub parked: usize,
}

/// A whole metadata cluster in one process.
pub struct LocalCluster {
    config: MetaConfig,
    ns: SharedNamespace,
    topology: ClusterTopology,
    ranks: BTreeMap<RankId, Rank>,
    media: DashMap<RankId, Arc<dyn JournalStore>>,
    armed: HashMap<RankId, Box<dyn FailureInjector>>,
    bus: MessageBus,
    parked: Vec<Envelope>,
    pending_crashes: Vec<(RankId, String)>,
    crashes: Vec<CrashRecord>,
    now: u64,
    check_invariants: bool,
}

impl LocalCluster {
    /// Starts `max_active_ranks` ranks and settles them.
    pub fn new(config: MetaConfig) -> Result<Self, MetaError> {
        config.validate()?;
        let topology = ClusterTopology::new(
            config.max_active_ranks,
            config.standby_count,
            config.max_ranks,
            config.beacon_grace_ticks,
        )?;
        let mut cluster = Self {
            ns: Namespace::shared(),
            topology,
            ranks: BTreeMap::new(),
            media: DashMap::new(),
            armed: HashMap::new(),
            bus: MessageBus::new(),
            parked: Vec::new(),
            pending_crashes: Vec::new(),
            crashes: Vec::new(),
            now: 0,
            check_invariants: false,
            config,
        };
        for kp in cluster.config.kill_points.clone() {
            cluster.arm_kill_point(RankId::new(kp.rank), kp.export_at, kp.import_at)?;
        }
        for r in 0..cluster.config.max_active_ranks {
            let rank = RankId::new(r);
            let gid = cluster.topology.create_rank(rank)?;
            cluster.boot(rank, gid)?;
            cluster.pump()?;
        }
        cluster.settle()?;
        tracing::info!(ranks = cluster.ranks.len(), "cluster started");
        Ok(cluster)
    }

    /// The shared namespace.
    pub fn namespace(&self) -> &SharedNamespace {
        &self.ns
    }

    /// Current tick.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Live daemon for a rank slot.
    pub fn rank(&self, rank: RankId) -> Option<&Rank> {
        self.ranks.get(&rank)
    }

    /// Daemon currently assigned to a rank slot, live or not.
    pub fn gid(&self, rank: RankId) -> Option<DaemonGid> {
        self.topology.gid_of(rank)
    }

    /// Topology state of a rank slot.
    pub fn rank_state(&self, rank: RankId) -> Option<RankState> {
        self.topology.state_of(rank)
    }

    /// Daemons lost so far.
    pub fn crashes(&self) -> &[CrashRecord] {
        &self.crashes
    }

    /// Journal medium of a rank slot.
    pub fn journal_store(&self, rank: RankId) -> Option<Arc<dyn JournalStore>> {
        self.media.get(&rank).map(|s| s.value().clone())
    }

    /// Checks single authority after every delivery when set.
    pub fn set_invariant_checks(&mut self, enabled: bool) {
        self.check_invariants = enabled;
    }

    /// Creates a directory and any missing parents. Refused while the
    /// deepest existing ancestor sits under a frozen subtree.
    pub fn mkdir_p(&mut self, path: &str) -> Result<DirId, MetaError> {
        let path = DirPath::parse(path)?;
        let base = {
            let ns = read_namespace(&self.ns)?;
            let mut base = path.clone();
            loop {
                match ns.lookup(&base) {
                    Ok(id) if base == path => return Ok(id),
                    Ok(id) => break id,
                    Err(MetaError::NotFound(_)) => match base.parent() {
                        Some(parent) => base = parent,
                        None => return Err(MetaError::NotFound(path.to_string())),
                    },
                    Err(e) => return Err(e),
                }
            }
        };
        for rank in self.ranks.values() {
            if let Some(frozen) = rank.create_blocker(base)? {
                tracing::debug!(%path, %frozen, "create refused under frozen subtree");
                return Err(MetaError::Frozen(frozen.to_string()));
            }
        }
        write_namespace(&self.ns)?.mkdir_p(&path)
    }

    /// Moves directory `from` to `to`, which must not exist yet.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), MetaError> {
        let from = DirPath::parse(from)?;
        let to = DirPath::parse(to)?;
        let (dir, dest_parent) = {
            let ns = read_namespace(&self.ns)?;
            let dir = ns.lookup(&from)?;
            let parent = to.parent().ok_or_else(|| MetaError::InvalidPath {
                path: to.to_string(),
                reason: "cannot replace the root".into(),
            })?;
            (dir, ns.lookup(&parent)?)
        };
        for rank in self.ranks.values() {
            let blocker = match rank.rename_blocker(dir)? {
                Some(path) => Some(path),
                None => rank.rename_blocker(dest_parent)?,
            };
            if let Some(path) = blocker {
                return Err(MetaError::Frozen(path.to_string()));
            }
        }
        write_namespace(&self.ns)?.rename(&from, &to)?;
        for rank in self.ranks.values_mut() {
            rank.apply_rename(&from, &to);
        }
        tracing::info!(%from, %to, "directory renamed");
        Ok(())
    }

    /// Sets a pin attribute the way `setfattr` would.
    pub fn set_pin(&mut self, path: &str, kind: PinKind, value: &str) -> Result<(), MetaError> {
        let path = DirPath::parse(path)?;
        let mode = parse_pin(kind, value, self.topology.max_ranks())?;
        {
            let mut ns = write_namespace(&self.ns)?;
            let dir = ns.lookup(&path)?;
            let current = ns.pin(dir)?;
            ns.set_pin(dir, apply_pin(current, kind, mode))?;
        }
        for rank in self.ranks.values_mut() {
            rank.on_pin_change();
        }
        tracing::info!(%path, attr = kind.attr_name(), value, "pin set");
        Ok(())
    }

    /// Reads a pin attribute the way `getfattr` would.
    pub fn get_pin(&self, path: &str, kind: PinKind) -> Result<String, MetaError> {
        let path = DirPath::parse(path)?;
        let ns = read_namespace(&self.ns)?;
        let dir = ns.lookup(&path)?;
        Ok(format_pin(ns.pin(dir)?, kind))
    }

    /// Sends a session request from `client` for `path` to rank 0.
    pub fn open_session(&mut self, client: ClientId, path: &str) -> Result<(), MetaError> {
        let path = DirPath::parse(path)?;
        let dir = read_namespace(&self.ns)?.lookup(&path)?;
        let env = client_envelope(
            RankId::ZERO,
            SessionRequest {
                client,
                dir,
                path,
                hops: 0,
            },
        );
        if self.ranks.contains_key(&RankId::ZERO) {
            self.bus.send(env)
        } else {
            self.parked.push(env);
            Ok(())
        }
    }

    /// Ranks holding a session for `client` on `path`. Fails with
    /// [`MetaError::SessionDropped`] when no rank holds it because a rank
    /// gave up forwarding the request.
    pub fn session_servers(&self, client: ClientId, path: &str) -> Result<Vec<RankId>, MetaError> {
        let path = DirPath::parse(path)?;
        let dir = read_namespace(&self.ns)?.lookup(&path)?;
        let servers: Vec<RankId> = self
            .ranks
            .values()
            .filter(|r| r.sessions().is_established(client, dir))
            .map(|r| r.id())
            .collect();
        if servers.is_empty() {
            let dropped = self
                .ranks
                .values()
                .find_map(|r| r.sessions().dropped_for(client, dir));
            if let Some(req) = dropped {
                return Err(MetaError::SessionDropped {
                    client,
                    path: req.path.to_string(),
                    hops: req.hops,
                });
            }
        }
        Ok(servers)
    }

    /// Toggles session-race injection on every rank, current and future.
    pub fn set_session_race(&mut self, enabled: bool) -> Result<(), MetaError> {
        self.config.inject_session_race = enabled;
        let ids: Vec<RankId> = self.ranks.keys().copied().collect();
        for id in ids {
            if let Some(rank) = self.ranks.get_mut(&id) {
                let result = rank.set_session_race(enabled);
                self.apply_result(id, result)?;
            }
        }
        self.settle_effects()
    }

    /// Exports the subtree at `path` to `dest` from whichever rank owns it.
    pub fn export_dir(&mut self, path: &str, dest: u32) -> Result<(), MetaError> {
        let path = DirPath::parse(path)?;
        let dir = read_namespace(&self.ns)?.lookup(&path)?;
        let dest = RankId::new(dest);
        let owner = self
            .authority(dir)?
            .ok_or_else(|| MetaError::NotFound(format!("no authority for {}", path)))?;
        if owner == dest {
            return Ok(());
        }
        let Some(rank) = self.ranks.get_mut(&owner) else {
            return Err(MetaError::RankUnavailable(owner));
        };
        match rank.start_export(dir, dest) {
            Err(e) if !e.is_kill_point() => return Err(e),
            result => self.apply_result(owner, result)?,
        }
        self.settle_effects()
    }

    /// Changes the number of active ranks. New slots take standbys; ranks
    /// at or above `n` shed their subtrees and leave.
    pub fn set_max_active(&mut self, n: u32) -> Result<(), MetaError> {
        let old = self.topology.max_active();
        let vacant = (old..n)
            .filter(|r| self.topology.identity(RankId::new(*r)).is_none())
            .count();
        if vacant > self.topology.standby_count() {
            return Err(MetaError::ConfigError(format!(
                "max_active {} needs {} standbys, {} available",
                n,
                vacant,
                self.topology.standby_count()
            )));
        }
        self.topology.set_max_active(n)?;
        self.config.max_active_ranks = n;
        for r in n..old {
            let rank = RankId::new(r);
            if self.topology.state_of(rank) == Some(RankState::Active) {
                self.topology.mark_stopping(rank)?;
            }
        }
        self.settle_effects()?;
        for r in old..n {
            let rank = RankId::new(r);
            if self.topology.identity(rank).is_none() {
                let gid = self.topology.assign_standby(rank)?;
                self.boot(rank, gid)?;
            }
        }
        tracing::info!(from = old, to = n, "max_active changed");
        Ok(())
    }

    /// Kills a rank's daemon.
    pub fn fail_rank(&mut self, rank: RankId) -> Result<(), MetaError> {
        if !self.ranks.contains_key(&rank) {
            return Err(MetaError::RankUnavailable(rank));
        }
        self.pending_crashes
            .push((rank, "failed by administrator".to_string()));
        self.settle_effects()
    }

    /// Arms kill points on a rank. A live daemon is armed in place;
    /// otherwise the next daemon to take the slot is.
    pub fn arm_kill_point(
        &mut self,
        rank: RankId,
        export_at: Option<u8>,
        import_at: Option<u8>,
    ) -> Result<(), MetaError> {
        let injector = Box::new(KillPointInjector::new(export_at, import_at)?);
        match self.ranks.get_mut(&rank) {
            Some(r) => r.set_injector(injector),
            None => {
                self.armed.insert(rank, injector);
            }
        }
        tracing::debug!(%rank, ?export_at, ?import_at, "kill point armed");
        Ok(())
    }

    /// Delivers one message, or runs one balancing pass if the bus is empty.
    /// Returns true if anything was sent or delivered.
    pub fn step(&mut self) -> Result<bool, MetaError> {
        if let Some(env) = self.bus.recv()? {
            self.deliver(env)?;
            if self.check_invariants {
                self.check_single_authority()?;
            }
            self.rebalance_all()?;
            return Ok(true);
        }
        self.rebalance_all()?;
        Ok(!self.bus.is_empty())
    }

    /// Advances the clock one tick.
    pub fn tick(&mut self) -> Result<(), MetaError> {
        self.now += 1;
        for rank in self.topology.takeovers_due(self.now) {
            if self.ranks.contains_key(&rank) {
                continue;
            }
            let gid = self.topology.assign_standby(rank)?;
            self.boot(rank, gid)?;
        }
        let ids: Vec<RankId> = self.ranks.keys().copied().collect();
        for id in ids {
            if let Some(rank) = self.ranks.get_mut(&id) {
                let result = rank.tick(self.now);
                self.apply_result(id, result)?;
            }
        }
        self.settle_effects()?;
        self.retire_stopped()
    }

    /// Runs until no messages, migrations, failures or backoffs remain.
    pub fn settle(&mut self) -> Result<(), MetaError> {
        let mut steps = 0usize;
        loop {
            if steps >= self.config.settle_max_steps {
                return Err(MetaError::NotConverged(format!(
                    "still busy after {} steps: {} messages in flight, {} failed ranks",
                    steps,
                    self.bus.len(),
                    self.topology.failed_ranks().len()
                )));
            }
            steps += 1;
            if self.step()? {
                continue;
            }
            if self.is_quiescent() {
                tracing::debug!(steps, tick = self.now, "cluster settled");
                return Ok(());
            }
            self.tick()?;
        }
    }

    /// True when there is nothing left to do.
    pub fn is_quiescent(&self) -> bool {
        self.bus.is_empty()
            && self.parked.is_empty()
            && self.pending_crashes.is_empty()
            && self.topology.failed_ranks().is_empty()
            && self.ranks.values().all(|r| {
                r.state() == RankState::Active && !r.has_operations() && !r.has_pending_retry()
            })
    }

    /// Cluster-wide status.
    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            tick: self.now,
            max_active: self.topology.max_active(),
            standbys: self.topology.standby_count(),
            ranks: self.topology.identities(),
            daemons: self.ranks.values().map(Rank::status).collect(),
            crashes: self.crashes.clone(),
            in_flight: self.bus.len(),
            parked: self.parked.len(),
        }
    }

    /// A rank's view of the subtree boundaries.
    pub fn subtrees(&self, rank: RankId) -> Result<Vec<(DirPath, RankId)>, MetaError> {
        self.ranks
            .get(&rank)
            .map(Rank::view)
            .ok_or(MetaError::RankUnavailable(rank))
    }

    /// Ranks a rank has exported to since it became active.
    pub fn export_targets(&self, rank: RankId) -> Result<Vec<RankId>, MetaError> {
        self.ranks
            .get(&rank)
            .map(Rank::export_targets)
            .ok_or(MetaError::RankUnavailable(rank))
    }

    /// The live rank authoritative for `dir`, if exactly one is.
    pub fn authority(&self, dir: DirId) -> Result<Option<RankId>, MetaError> {
        let ns = read_namespace(&self.ns)?;
        let mut owner = None;
        for rank in self.ranks.values() {
            if rank.map().is_authoritative(&ns, dir)? {
                if let Some(first) = owner {
                    return Err(MetaError::SplitAuthority {
                        path: ns.path_of(dir)?.to_string(),
                        first,
                        second: rank.id(),
                    });
                }
                owner = Some(rank.id());
            }
        }
        Ok(owner)
    }

    /// The rank authoritative for `path`.
    pub fn authority_of(&self, path: &str) -> Result<Option<RankId>, MetaError> {
        let path = DirPath::parse(path)?;
        let dir = read_namespace(&self.ns)?.lookup(&path)?;
        self.authority(dir)
    }

    /// Fails if any directory has more than one authoritative rank or any
    /// rank raised a split-authority alarm.
    pub fn check_single_authority(&self) -> Result<(), MetaError> {
        if let Some(alarm) = self.ranks.values().flat_map(|r| r.alarms()).next() {
            return Err(alarm.to_error());
        }
        let dirs = {
            let ns = read_namespace(&self.ns)?;
            let mut dirs = vec![DirId::ROOT];
            dirs.extend(ns.descendants(DirId::ROOT)?);
            dirs
        };
        for dir in dirs {
            self.authority(dir)?;
        }
        Ok(())
    }

    fn store_for(&self, rank: RankId) -> Result<Arc<dyn JournalStore>, MetaError> {
        if let Some(store) = self.media.get(&rank) {
            return Ok(store.value().clone());
        }
        let store: Arc<dyn JournalStore> = match &self.config.journal_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("rank{}.journal", rank.as_u32()));
                Arc::new(FileJournalStore::open(&path)?)
            }
            None => Arc::new(MemoryJournalStore::new()),
        };
        self.media.insert(rank, store.clone());
        Ok(store)
    }

    fn boot(&mut self, rank: RankId, gid: DaemonGid) -> Result<(), MetaError> {
        let store = self.store_for(rank)?;
        let injector = self
            .armed
            .remove(&rank)
            .unwrap_or_else(|| Box::new(NoopInjector));
        let started = Rank::start(RankStart {
            id: rank,
            gid,
            ns: self.ns.clone(),
            store,
            injector,
            peers: self.topology.identities(),
            max_active: self.topology.max_active(),
            config: self.config.rank_config(),
        });
        match started {
            Ok((daemon, out)) => {
                self.ranks.insert(rank, daemon);
                self.bus.send_all(out)?;
            }
            Err(e) if e.is_fatal() => {
                self.topology.mark_failed(rank, self.now)?;
                self.crashes.push(CrashRecord {
                    rank,
                    gid,
                    tick: self.now,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
        self.settle_effects()
    }

    /// Delivers whatever is on the bus without balancing or ticking.
    fn pump(&mut self) -> Result<(), MetaError> {
        while let Some(env) = self.bus.recv()? {
            self.deliver(env)?;
        }
        Ok(())
    }

    fn deliver(&mut self, env: Envelope) -> Result<(), MetaError> {
        if let Source::Rank { rank, gid } = env.from {
            if !self.topology.is_current(rank, gid) {
                tracing::debug!(from = %env.from, kind = env.message.kind(), "dropping message from stale daemon");
                return Ok(());
            }
        }
        let to = env.to;
        let Some(target) = self.ranks.get_mut(&to) else {
            // Session requests outlive the daemon they were sent to; the
            // client reconnects once the rank is back.
            match env.message {
                RankMessage::Session(req) => self.parked.push(client_envelope(to, req)),
                message => {
                    tracing::debug!(%to, kind = message.kind(), "dropping message for absent rank")
                }
            }
            return Ok(());
        };
        if let Some(gid) = env.to_gid {
            if gid != target.gid() {
                match env.message {
                    RankMessage::Session(req) => self.bus.send(client_envelope(to, req))?,
                    message => {
                        tracing::debug!(%to, %gid, kind = message.kind(), "dropping message for stale daemon")
                    }
                }
                return Ok(());
            }
        }
        let result = target.handle(env);
        self.apply_result(to, result)?;
        self.settle_effects()
    }

    fn rebalance_all(&mut self) -> Result<(), MetaError> {
        let ids: Vec<RankId> = self.ranks.keys().copied().collect();
        for id in ids {
            if let Some(rank) = self.ranks.get_mut(&id) {
                let result = rank.rebalance();
                self.apply_result(id, result)?;
            }
        }
        self.settle_effects()
    }

    fn apply_result(
        &mut self,
        rank: RankId,
        result: Result<Vec<Envelope>, MetaError>,
    ) -> Result<(), MetaError> {
        match result {
            Ok(out) => self.bus.send_all(out),
            Err(e) if e.is_fatal() => {
                if !e.is_kill_point() {
                    tracing::error!(%rank, error = %e, "rank stopping on fatal error");
                }
                self.pending_crashes.push((rank, e.to_string()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%rank, error = %e, "rank handler failed");
                Ok(())
            }
        }
    }

    /// Processes crashes, activations and topology events until none are left.
    fn settle_effects(&mut self) -> Result<(), MetaError> {
        loop {
            if let Some((rank, reason)) = self.pending_crashes.pop() {
                self.crash(rank, reason)?;
                continue;
            }
            self.activate_ready()?;
            let events = self.topology.drain_events();
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                tracing::debug!(?event, "topology event");
                let ids: Vec<RankId> = self.ranks.keys().copied().collect();
                for id in ids {
                    if let Some(rank) = self.ranks.get_mut(&id) {
                        let result = rank.handle_topology(&event);
                        self.apply_result(id, result)?;
                    }
                }
            }
        }
    }

    fn crash(&mut self, rank: RankId, reason: String) -> Result<(), MetaError> {
        let Some(mut daemon) = self.ranks.remove(&rank) else {
            return Ok(());
        };
        let gid = daemon.gid();
        for req in daemon.take_client_requests() {
            self.parked.push(client_envelope(rank, req));
        }
        drop(daemon);
        self.topology.mark_failed(rank, self.now)?;
        tracing::warn!(%rank, %gid, %reason, "daemon crashed");
        self.crashes.push(CrashRecord {
            rank,
            gid,
            tick: self.now,
            reason,
        });
        Ok(())
    }

    /// Announces ranks that finished resolve and releases their parked clients.
    fn activate_ready(&mut self) -> Result<(), MetaError> {
        let ready: Vec<(RankId, RankState)> = self
            .ranks
            .values()
            .filter(|r| {
                r.is_active() && self.topology.state_of(r.id()) == Some(RankState::StandbyReplay)
            })
            .map(|r| (r.id(), r.state()))
            .collect();
        for (rank, state) in ready {
            self.topology.mark_active(rank)?;
            if state == RankState::Stopping {
                self.topology.mark_stopping(rank)?;
            }
            let (mine, rest): (Vec<Envelope>, Vec<Envelope>) =
                std::mem::take(&mut self.parked).into_iter().partition(|e| e.to == rank);
            self.parked = rest;
            self.bus.send_all(mine)?;
        }
        Ok(())
    }

    /// Removes stopping ranks that have shed everything.
    fn retire_stopped(&mut self) -> Result<(), MetaError> {
        let drained: Vec<RankId> = self
            .ranks
            .values()
            .filter(|r| r.is_drained())
            .map(|r| r.id())
            .collect();
        for rank in drained {
            let Some(mut daemon) = self.ranks.remove(&rank) else {
                continue;
            };
            for req in daemon.take_client_requests() {
                self.bus.send(client_envelope(RankId::ZERO, req))?;
            }
            for env in self.parked.iter_mut().filter(|e| e.to == rank) {
                env.to = RankId::ZERO;
                env.to_gid = None;
            }
            if let Some((_, store)) = self.media.remove(&rank) {
                store.truncate_before(u64::MAX)?;
            }
            self.topology.remove(rank)?;
        }
        self.settle_effects()
    }
}

fn client_envelope(to: RankId, req: SessionRequest) -> Envelope {
    Envelope {
        from: Source::Client(req.client),
        to,
        to_gid: None,
        message: RankMessage::Session(req),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::FailingStore;

    fn cluster(max_active: u32) -> LocalCluster {
        LocalCluster::new(MetaConfig {
            max_active_ranks: max_active,
            standby_count: 2,
            ..MetaConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_starts_active() {
        let c = cluster(2);
        assert_eq!(c.rank_state(RankId::ZERO), Some(RankState::Active));
        assert_eq!(c.rank_state(RankId::new(1)), Some(RankState::Active));
        assert!(c.is_quiescent());
        assert_eq!(c.authority(DirId::ROOT).unwrap(), Some(RankId::ZERO));
    }

    #[test]
    fn test_export_dir_moves_authority() {
        let mut c = cluster(2);
        c.mkdir_p("/abc").unwrap();
        c.export_dir("/abc", 1).unwrap();
        c.settle().unwrap();
        assert_eq!(c.authority_of("/abc").unwrap(), Some(RankId::new(1)));
        assert_eq!(
            c.subtrees(RankId::ZERO).unwrap(),
            vec![(DirPath::parse("/abc").unwrap(), RankId::new(1))]
        );
        c.check_single_authority().unwrap();
    }

    #[test]
    fn test_failed_rank_is_replaced() {
        let mut c = cluster(2);
        let before = c.gid(RankId::new(1)).unwrap();
        c.fail_rank(RankId::new(1)).unwrap();
        assert_eq!(c.rank_state(RankId::new(1)), Some(RankState::Failed));
        c.settle().unwrap();
        assert_eq!(c.rank_state(RankId::new(1)), Some(RankState::Active));
        assert_ne!(c.gid(RankId::new(1)).unwrap(), before);
        assert_eq!(c.crashes().len(), 1);
    }

    #[test]
    fn test_session_served_by_root_owner() {
        let mut c = cluster(1);
        c.mkdir_p("/home").unwrap();
        c.open_session(ClientId::new(1), "/home").unwrap();
        c.settle().unwrap();
        assert_eq!(
            c.session_servers(ClientId::new(1), "/home").unwrap(),
            vec![RankId::ZERO]
        );
    }

    #[test]
    fn test_journal_failure_stops_rank() {
        let mut c = cluster(2);
        c.mkdir_p("/abc").unwrap();
        let one = RankId::new(1);
        let store = Arc::new(FailingStore::wrap(c.journal_store(one).unwrap()));
        c.media.insert(one, store.clone());
        c.fail_rank(one).unwrap();
        c.settle().unwrap();
        assert_eq!(c.crashes().len(), 1);

        store.set_failing(true);
        c.export_dir("/abc", 1).unwrap();
        for _ in 0..1000 {
            if c.crashes().len() == 2 {
                break;
            }
            if !c.step().unwrap() {
                c.tick().unwrap();
            }
        }
        assert_eq!(c.crashes().len(), 2);
        assert_eq!(c.crashes()[1].rank, one);
        assert!(c.crashes()[1].reason.contains("journal"));
        assert_eq!(c.rank_state(one), Some(RankState::Failed));

        store.set_failing(false);
        c.settle().unwrap();
        c.check_single_authority().unwrap();
        assert_eq!(c.rank_state(one), Some(RankState::Active));
        assert_eq!(c.authority_of("/abc").unwrap(), Some(one));
        assert_eq!(c.crashes().len(), 2);
        assert_eq!(c.status().standbys, 0);
    }
}
