//! A metadata rank: one daemon's view of the cluster and its migration state.
//!
//! A rank is a single-owner state machine. Every input (a message, a topology
//! event, a clock tick) goes through a `&mut self` handler that returns the
//! envelopes to send. A handler that returns [`MetaError::KillPoint`] has
//! crashed the rank: journal records written before the failure are durable,
//! the envelopes it would have sent are lost.
//!
//! The migration protocol itself lives in `export`, `import` and `recovery`;
//! policy lives in `balancer`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::export::ExportState;
use crate::failpoint::FailureInjector;
use crate::import::ImportState;
use crate::journal::MigrationJournal;
use crate::messages::{BoundaryUpdate, RankMessage};
use crate::migration::OperationStatus;
use crate::namespace::{read_namespace, DirPath, SharedNamespace};
use crate::recovery::ResolveState;
use crate::session::{route_session, SessionGuard, SessionRequest, SessionRoute};
use crate::subtree::{BoundaryState, SubtreeMap};
use crate::topology::{RankState, TopologyEvent};
use crate::transport::{Envelope, Source};
use crate::types::{DaemonGid, DirId, MetaError, MigrationSide, OperationId, RankId};

/// Per-rank tunables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankConfig {
    /// Ticks an export may spend before its point of no return
    pub export_timeout_ticks: u64,
    /// Ticks before a failed export of the same subtree to the same rank is retried
    pub retry_backoff_ticks: u64,
    /// Forwarding budget for session requests
    pub max_session_hops: u8,
    /// Hold released session requests until cleared
    pub inject_session_race: bool,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            export_timeout_ticks: 30,
            retry_backoff_ticks: 4,
            max_session_hops: crate::session::DEFAULT_MAX_HOPS,
            inject_session_race: false,
        }
    }
}

/// What a rank knows about another rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PeerInfo {
    pub(crate) gid: DaemonGid,
    pub(crate) state: RankState,
}

/// Two ranks found claiming the same subtree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SplitAlarm {
    /// Subtree root path
    pub path: DirPath,
    /// One claimant
    pub first: RankId,
    /// The other claimant
    pub second: RankId,
}

impl SplitAlarm {
    /// The alarm as an error.
    pub fn to_error(&self) -> MetaError {
        MetaError::SplitAuthority {
            path: self.path.to_string(),
            first: self.first,
            second: self.second,
        }
    }
}

/// One boundary in a status report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BoundaryStatus {
    /// Root path
    pub path: DirPath,
    /// Authority in this rank's view
    pub auth: RankId,
    /// Migration marker
    pub state: BoundaryState,
    /// Structural mutation blocked
    pub frozen: bool,
    /// Authority epoch
    pub epoch: u64,
}

/// Status report of one rank.
#[derive(Clone, Debug, Serialize)]
pub struct RankStatus {
    /// Rank slot
    pub rank: RankId,
    /// Serving daemon
    pub gid: DaemonGid,
    /// Lifecycle state
    pub state: RankState,
    /// Every boundary this rank knows about
    pub subtrees: Vec<BoundaryStatus>,
    /// Ranks exported to since becoming active
    pub export_targets: Vec<RankId>,
    /// In-flight migrations
    pub operations: Vec<OperationStatus>,
    /// Established sessions
    pub sessions: usize,
    /// Requests waiting on imports
    pub queued_sessions: usize,
    /// Requests dropped for exceeding the hop budget
    pub dropped_sessions: u64,
    /// Split-authority alarms raised
    pub alarms: Vec<SplitAlarm>,
}

/// One metadata rank.
pub struct Rank {
    pub(crate) id: RankId,
    pub(crate) gid: DaemonGid,
    pub(crate) state: RankState,
    pub(crate) ns: SharedNamespace,
    pub(crate) map: SubtreeMap,
    pub(crate) journal: MigrationJournal,
    pub(crate) injector: Box<dyn FailureInjector>,
    pub(crate) peers: BTreeMap<RankId, PeerInfo>,
    pub(crate) max_active: u32,
    pub(crate) exports: BTreeMap<OperationId, ExportState>,
    pub(crate) imports: BTreeMap<OperationId, ImportState>,
    pub(crate) sessions: SessionGuard,
    pub(crate) failed_attempts: HashMap<(DirId, RankId), u64>,
    pub(crate) resolve: Option<ResolveState>,
    pub(crate) deferred: Vec<Envelope>,
    pub(crate) alarms: Vec<SplitAlarm>,
    pub(crate) now: u64,
    pub(crate) config: RankConfig,
}

impl Rank {
    /// Rank slot.
    pub fn id(&self) -> RankId {
        self.id
    }

    /// Daemon serving this rank.
    pub fn gid(&self) -> DaemonGid {
        self.gid
    }

    /// Lifecycle state.
    pub fn state(&self) -> RankState {
        self.state
    }

    /// True once resolve has finished. Stopping ranks still serve.
    pub fn is_active(&self) -> bool {
        matches!(self.state, RankState::Active | RankState::Stopping)
    }

    /// The subtree map.
    pub fn map(&self) -> &SubtreeMap {
        &self.map
    }

    /// Non-root boundaries as `(path, auth)`.
    pub fn view(&self) -> Vec<(DirPath, RankId)> {
        self.map.view()
    }

    /// Ranks exported to since this incarnation became active.
    pub fn export_targets(&self) -> Vec<RankId> {
        self.map.export_targets().iter().copied().collect()
    }

    /// The session table.
    pub fn sessions(&self) -> &SessionGuard {
        &self.sessions
    }

    /// Split-authority alarms raised so far.
    pub fn alarms(&self) -> &[SplitAlarm] {
        &self.alarms
    }

    /// True if this rank is authoritative for `dir`.
    pub fn is_authoritative(&self, dir: DirId) -> Result<bool, MetaError> {
        let ns = read_namespace(&self.ns)?;
        self.map.is_authoritative(&ns, dir)
    }

    /// True while a migration runs on either side.
    pub fn has_operations(&self) -> bool {
        !self.exports.is_empty() || !self.imports.is_empty()
    }

    /// True while a failed export is waiting out its backoff.
    pub fn has_pending_retry(&self) -> bool {
        !self.failed_attempts.is_empty()
    }

    /// True when a stopping rank has shed everything.
    pub fn is_drained(&self) -> bool {
        self.state == RankState::Stopping && self.map.owned().is_empty() && !self.has_operations()
    }

    /// Replaces the failure injector.
    pub fn set_injector(&mut self, injector: Box<dyn FailureInjector>) {
        self.injector = injector;
    }

    /// Toggles session-race injection. Turning it off re-routes whatever was held.
    pub fn set_session_race(&mut self, enabled: bool) -> Result<Vec<Envelope>, MetaError> {
        self.config.inject_session_race = enabled;
        let released = self.sessions.set_hold(enabled);
        self.route_requests(released)
    }

    /// Takes every client-facing request this rank holds: established
    /// sessions, queued requests and deferred client messages. Used when the
    /// rank goes away and its clients must reconnect.
    pub fn take_client_requests(&mut self) -> Vec<SessionRequest> {
        let mut reqs = self.sessions.drain_all();
        for env in std::mem::take(&mut self.deferred) {
            if let (Source::Client(_), RankMessage::Session(mut req)) = (env.from, env.message) {
                req.hops = 0;
                reqs.push(req);
            }
        }
        reqs
    }

    /// Snapshot for status output.
    pub fn status(&self) -> RankStatus {
        let subtrees = self
            .map
            .boundaries()
            .map(|b| BoundaryStatus {
                path: b.root_path.clone(),
                auth: b.auth,
                state: b.state.clone(),
                frozen: b.frozen,
                epoch: b.epoch,
            })
            .collect();
        let operations = self
            .exports
            .values()
            .map(|e| OperationStatus {
                id: e.op.id,
                side: MigrationSide::Export,
                phase: e.phase.number(),
                root_path: e.op.root_path.clone(),
                peer: e.op.dest,
                durable: e.phase.is_durable(),
            })
            .chain(self.imports.values().map(|i| OperationStatus {
                id: i.op.id,
                side: MigrationSide::Import,
                phase: i.phase.number(),
                root_path: i.op.root_path.clone(),
                peer: i.op.source,
                durable: i.phase.is_durable(),
            }))
            .collect();
        RankStatus {
            rank: self.id,
            gid: self.gid,
            state: self.state,
            subtrees,
            export_targets: self.export_targets(),
            operations,
            sessions: self.sessions.len(),
            queued_sessions: self.sessions.queued_count(),
            dropped_sessions: self.sessions.dropped().len() as u64,
            alarms: self.alarms.clone(),
        }
    }

    /// Handles one inbound message.
    pub fn handle(&mut self, env: Envelope) -> Result<Vec<Envelope>, MetaError> {
        if !self.is_active() {
            let resolving = matches!(
                env.message,
                RankMessage::ResolveRequest { .. } | RankMessage::ResolveReply { .. }
            );
            if !resolving {
                tracing::trace!(rank = %self.id, kind = env.message.kind(), "deferring until active");
                self.deferred.push(env);
                return Ok(Vec::new());
            }
        }

        let from = env.from;
        match env.message {
            RankMessage::ExportDiscover { op } => self.handle_discover(from, op),
            RankMessage::ExportDiscoverAck {
                op_id,
                accepted,
                reason,
            } => self.handle_discover_ack(op_id, accepted, reason),
            RankMessage::ExportPrep { op, payload } => self.handle_prep(from, op, payload),
            RankMessage::ExportPrepAck {
                op_id,
                accepted,
                reason,
            } => self.handle_prep_ack(op_id, accepted, reason),
            RankMessage::ExportWarning { op } => self.handle_warning(from, op),
            RankMessage::ExportWarningAck { op_id } => self.handle_warning_ack(from, op_id),
            RankMessage::ExportDir {
                op,
                payload,
                sessions,
            } => self.handle_export_dir(from, op, payload, sessions),
            RankMessage::ExportDirAck { op_id } => self.handle_export_dir_ack(op_id),
            RankMessage::ExportFinish { op } => self.handle_export_finish(from, op),
            RankMessage::ExportFinishAck { op_id } => self.handle_export_finish_ack(op_id),
            RankMessage::ExportCancel { op_id, root } => self.handle_cancel(op_id, root),
            RankMessage::SubtreeUpdate(update) => self.handle_subtree_update(update),
            RankMessage::ResolveRequest { claims } => self.handle_resolve_request(from, claims),
            RankMessage::ResolveReply { claims } => self.handle_resolve_reply(from, claims),
            RankMessage::Session(req) => self.route_requests(vec![req]),
        }
    }

    /// Applies a topology change.
    pub fn handle_topology(&mut self, event: &TopologyEvent) -> Result<Vec<Envelope>, MetaError> {
        let mut out = Vec::new();
        match *event {
            TopologyEvent::RankFailed { rank, gid } => {
                if rank == self.id {
                    return Ok(out);
                }
                self.peers.insert(
                    rank,
                    PeerInfo {
                        gid,
                        state: RankState::Failed,
                    },
                );
                self.failed_attempts.clear();
                out.extend(self.exports_on_peer_failed(rank)?);
                out.extend(self.imports_on_peer_failed(rank)?);
                self.clear_ambiguous_from(rank);
                out.extend(self.resolve_on_peer_failed(rank)?);
            }
            TopologyEvent::RankUp { rank, gid } => {
                if rank == self.id {
                    return Ok(out);
                }
                let state = if rank.as_u32() >= self.max_active {
                    RankState::Stopping
                } else {
                    RankState::Active
                };
                self.peers.insert(rank, PeerInfo { gid, state });
                self.failed_attempts.clear();
                if self.is_active() {
                    out.push(self.envelope(
                        rank,
                        RankMessage::ResolveReply {
                            claims: self.map.claims(),
                        },
                    ));
                    out.extend(self.exports_on_peer_up(rank)?);
                }
            }
            TopologyEvent::MaxActive(n) => {
                self.max_active = n;
                self.failed_attempts.clear();
                for (rank, peer) in self.peers.iter_mut() {
                    if rank.as_u32() >= n && peer.state == RankState::Active {
                        peer.state = RankState::Stopping;
                    }
                }
                if self.id.as_u32() >= n && self.state == RankState::Active {
                    tracing::info!(rank = %self.id, max_active = n, "rank stopping");
                    self.state = RankState::Stopping;
                }
            }
            TopologyEvent::RankStopped(rank) => {
                self.peers.remove(&rank);
                self.failed_attempts.clear();
            }
        }
        Ok(out)
    }

    /// Advances the rank's clock: expires backoffs and times out exports.
    pub fn tick(&mut self, now: u64) -> Result<Vec<Envelope>, MetaError> {
        self.now = now;
        self.failed_attempts.retain(|_, until| *until > now);
        self.expire_exports()
    }

    /// Called after any pin change: stale backoffs no longer apply.
    pub fn on_pin_change(&mut self) {
        self.failed_attempts.clear();
    }

    pub(crate) fn source(&self) -> Source {
        Source::Rank {
            rank: self.id,
            gid: self.gid,
        }
    }

    /// Envelope to `to`, addressed to the daemon this rank believes serves it.
    pub(crate) fn envelope(&self, to: RankId, message: RankMessage) -> Envelope {
        Envelope {
            from: self.source(),
            to,
            to_gid: self.peers.get(&to).map(|p| p.gid),
            message,
        }
    }

    /// Reply to the exact daemon that sent a message; clients get nothing.
    pub(crate) fn reply(&self, to: Source, message: RankMessage) -> Vec<Envelope> {
        match to {
            Source::Rank { rank, gid } => vec![Envelope {
                from: self.source(),
                to: rank,
                to_gid: Some(gid),
                message,
            }],
            Source::Client(_) => Vec::new(),
        }
    }

    pub(crate) fn kill_check(&self, side: MigrationSide, phase: u8) -> Result<(), MetaError> {
        self.injector.check(side, phase)
    }

    /// Peers that are up, including stopping ones.
    pub(crate) fn live_peers(&self) -> Vec<RankId> {
        self.peers
            .iter()
            .filter(|(rank, p)| {
                **rank != self.id && matches!(p.state, RankState::Active | RankState::Stopping)
            })
            .map(|(rank, _)| *rank)
            .collect()
    }

    pub(crate) fn is_peer_live(&self, rank: RankId) -> bool {
        self.peers
            .get(&rank)
            .map_or(false, |p| matches!(p.state, RankState::Active | RankState::Stopping))
    }

    /// True if `rank` may receive a new import from this rank.
    pub(crate) fn can_export_to(&self, rank: RankId) -> bool {
        rank != self.id
            && rank.as_u32() < self.max_active
            && self
                .peers
                .get(&rank)
                .map_or(false, |p| p.state == RankState::Active)
    }

    /// Ranks policy may place subtrees on.
    pub(crate) fn existing_ranks(&self) -> BTreeSet<RankId> {
        (0..self.max_active).map(RankId::new).collect()
    }

    pub(crate) fn raise_alarm(&mut self, path: DirPath, first: RankId, second: RankId) {
        tracing::error!(rank = %self.id, %path, %first, %second, "split authority");
        let alarm = SplitAlarm {
            path,
            first,
            second,
        };
        if !self.alarms.contains(&alarm) {
            self.alarms.push(alarm);
        }
    }

    /// Returns bystander markers left by a dead exporter to stable.
    fn clear_ambiguous_from(&mut self, rank: RankId) {
        let roots: Vec<DirId> = self
            .map
            .boundaries()
            .filter(|b| b.auth == rank && matches!(b.state, BoundaryState::Ambiguous { .. }))
            .map(|b| b.root)
            .collect();
        for root in roots {
            if let Some(b) = self.map.get_mut(root) {
                b.state = BoundaryState::Stable;
            }
        }
    }

    /// Applies a boundary change announced by its authority.
    fn handle_subtree_update(&mut self, update: BoundaryUpdate) -> Result<Vec<Envelope>, MetaError> {
        if let Some(b) = self.map.get(update.root) {
            if b.is_owned_by(self.id) || b.is_pending() {
                tracing::debug!(rank = %self.id, root = %update.root_path, "ignoring update for local subtree");
                return Ok(Vec::new());
            }
            if b.epoch > update.epoch {
                tracing::debug!(rank = %self.id, root = %update.root_path, "ignoring stale update");
                return Ok(Vec::new());
            }
        }
        let path = {
            let ns = read_namespace(&self.ns)?;
            if !ns.contains(update.root) {
                return Ok(Vec::new());
            }
            ns.path_of(update.root)?
        };
        if update.removed {
            if update.root != DirId::ROOT {
                self.map.remove(update.root);
            }
        } else {
            self.map.set_auth(update.root, path, update.auth, update.epoch);
        }
        Ok(Vec::new())
    }

    /// Routes session requests: serve, queue behind an import, or forward.
    pub(crate) fn route_requests(
        &mut self,
        reqs: Vec<SessionRequest>,
    ) -> Result<Vec<Envelope>, MetaError> {
        let mut out = Vec::new();
        let handle = self.ns.clone();
        for mut req in reqs {
            let route = {
                let ns = read_namespace(&handle)?;
                if !ns.contains(req.dir) {
                    tracing::warn!(rank = %self.id, client = %req.client, path = %req.path, "session for missing directory");
                    self.sessions.record_drop(req);
                    continue;
                }
                let enclosing = self.map.enclosing(&ns, req.dir)?;
                let exporting_to = self
                    .exports
                    .values()
                    .find(|e| e.op.root == enclosing.root && e.phase.is_durable())
                    .map(|e| e.op.dest);
                route_session(
                    self.id,
                    enclosing,
                    exporting_to,
                    &req,
                    self.config.max_session_hops,
                )
            };
            match route {
                Ok(SessionRoute::Serve) => {
                    if self.sessions.establish(&req) {
                        tracing::debug!(rank = %self.id, client = %req.client, path = %req.path, "session established");
                    }
                }
                Ok(SessionRoute::Queue { root }) => {
                    tracing::debug!(rank = %self.id, client = %req.client, path = %req.path, "session queued behind import");
                    self.sessions.queue(root, req);
                }
                Ok(SessionRoute::Forward(next)) => {
                    req.hops += 1;
                    out.push(self.envelope(next, RankMessage::Session(req)));
                }
                Err(e) => {
                    tracing::warn!(rank = %self.id, client = %req.client, path = %req.path, hops = req.hops, error = %e, "session dropped");
                    self.sessions.record_drop(req);
                }
            }
        }
        Ok(out)
    }

    /// Checkpoints the map and drops journal records nothing needs.
    pub(crate) fn trim_journal(&mut self) -> Result<(), MetaError> {
        let open_starts: Vec<u64> = self
            .exports
            .values()
            .filter_map(|e| e.start_seq)
            .chain(self.imports.values().filter_map(|i| i.start_seq))
            .collect();
        self.journal.trim(self.map.checkpoint(), open_starts)?;
        Ok(())
    }
}
