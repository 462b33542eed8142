//! Rank startup: journal replay and the resolve round.
//!
//! A starting daemon rebuilds its map from the last checkpoint plus the
//! authority changes journaled after it, then restores every migration whose
//! start record is durable. Exports resume toward completion; imports come
//! back pending, waiting for the exporter's finish.
//!
//! The resolve round exchanges ownership claims with every live peer. Claims
//! only fill in the view: a rank never gives up a subtree it owns because a
//! peer says so. Conflicting claims raise a split-authority alarm.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::export::ExportState;
use crate::failpoint::FailureInjector;
use crate::import::ImportState;
use crate::journal::{JournalStore, MigrationJournal};
use crate::messages::RankMessage;
use crate::migration::{ExportPhase, ImportPhase};
use crate::namespace::{read_namespace, SharedNamespace};
use crate::rank::{PeerInfo, Rank, RankConfig};
use crate::session::SessionGuard;
use crate::subtree::{BoundaryClaim, BoundaryState, SubtreeBoundary, SubtreeMap};
use crate::topology::{RankIdentity, RankState};
use crate::transport::{Envelope, Source};
use crate::types::{DaemonGid, DirId, MetaError, OperationId, RankId};

/// Everything a daemon needs to take a rank.
pub struct RankStart {
    /// Rank slot
    pub id: RankId,
    /// This daemon
    pub gid: DaemonGid,
    /// Shared namespace
    pub ns: SharedNamespace,
    /// The rank's journal medium
    pub store: Arc<dyn JournalStore>,
    /// Kill-point injector for this incarnation
    pub injector: Box<dyn FailureInjector>,
    /// Other ranks as the topology sees them
    pub peers: Vec<RankIdentity>,
    /// Current number of active ranks
    pub max_active: u32,
    /// Tunables
    pub config: RankConfig,
}

/// Progress of the resolve round.
pub(crate) struct ResolveState {
    pub(crate) waiting: BTreeSet<RankId>,
    /// Root to (claimant, epoch) as heard during this round
    pub(crate) claimed: HashMap<DirId, (RankId, u64)>,
}

impl Rank {
    /// Replays the journal and starts resolve. Returns the rank with the
    /// resolve requests to send; a rank with no live peers is active at once.
    pub fn start(params: RankStart) -> Result<(Rank, Vec<Envelope>), MetaError> {
        let journal = MigrationJournal::open(params.store)?;
        let peers: BTreeMap<RankId, PeerInfo> = params
            .peers
            .iter()
            .filter(|p| p.rank != params.id)
            .map(|p| {
                (
                    p.rank,
                    PeerInfo {
                        gid: p.gid,
                        state: p.state,
                    },
                )
            })
            .collect();
        let mut rank = Rank {
            id: params.id,
            gid: params.gid,
            state: RankState::StandbyReplay,
            ns: params.ns,
            map: SubtreeMap::new(params.id),
            journal,
            injector: params.injector,
            peers,
            max_active: params.max_active,
            exports: BTreeMap::new(),
            imports: BTreeMap::new(),
            sessions: SessionGuard::new(params.config.inject_session_race),
            failed_attempts: HashMap::new(),
            resolve: None,
            deferred: Vec::new(),
            alarms: Vec::new(),
            now: 0,
            config: params.config,
        };
        tracing::info!(rank = %rank.id, gid = %rank.gid, "rank starting");
        rank.replay()?;
        let out = rank.begin_resolve()?;
        Ok((rank, out))
    }

    fn replay(&mut self) -> Result<(), MetaError> {
        let replay = self.journal.replay()?;
        if let Some(boundaries) = &replay.checkpoint {
            self.map = SubtreeMap::from_checkpoint(self.id, boundaries);
        }
        for change in &replay.changes {
            self.map
                .set_auth(change.root, change.root_path.clone(), change.auth, change.epoch);
            if change.auth == self.id {
                for record in &change.sessions {
                    self.sessions.install(record.clone());
                }
            }
        }

        let resumed_exports = replay.exports.len();
        for open in replay.exports {
            let op = open.op;
            if !self.map.contains(op.root) {
                let epoch = {
                    let ns = read_namespace(&self.ns)?;
                    match self.map.enclosing(&ns, op.root) {
                        Ok(b) => b.epoch,
                        Err(_) => 0,
                    }
                };
                self.map.insert(SubtreeBoundary::new(
                    op.root,
                    op.root_path.clone(),
                    self.id,
                    epoch,
                ));
            }
            if let Some(b) = self.map.get_mut(op.root) {
                b.frozen = true;
                if !open.finished {
                    b.state = BoundaryState::Ambiguous { dest: op.dest };
                }
            }
            let mut state = ExportState::new(op, self.now);
            state.phase = if open.finished {
                ExportPhase::LoggingFinish
            } else {
                ExportPhase::LoggingStart
            };
            state.payload = Some(open.payload);
            state.sessions = open.sessions;
            state.start_seq = Some(open.start_seq);
            self.exports.insert(state.op.id, state);
        }

        let restored_imports = replay.imports.len();
        for open in replay.imports {
            let op = open.op;
            let mut state = ImportState::new(op.clone());
            state.phase = ImportPhase::Acked;
            state.payload = Some(open.payload);
            state.sessions = open.sessions;
            state.start_seq = Some(open.start_seq);
            self.imports.insert(op.id, state);
            self.install_pending(&op, op.root_path.clone());
        }

        {
            let ns = read_namespace(&self.ns)?;
            self.map.refresh_paths(&ns);
            for e in self.exports.values_mut() {
                if let Ok(path) = ns.path_of(e.op.root) {
                    e.op.root_path = path;
                }
            }
            for i in self.imports.values_mut() {
                if let Ok(path) = ns.path_of(i.op.root) {
                    i.op.root_path = path;
                }
            }
        }
        tracing::info!(
            rank = %self.id,
            records = replay.records,
            boundaries = self.map.len(),
            exports = resumed_exports,
            imports = restored_imports,
            "journal replayed"
        );
        Ok(())
    }

    fn begin_resolve(&mut self) -> Result<Vec<Envelope>, MetaError> {
        let peers = self.live_peers();
        if peers.is_empty() {
            return self.finish_resolve();
        }
        tracing::info!(rank = %self.id, peers = ?peers, "resolve started");
        self.resolve = Some(ResolveState {
            waiting: peers.iter().copied().collect(),
            claimed: HashMap::new(),
        });
        let claims = self.map.claims();
        Ok(peers
            .into_iter()
            .map(|p| {
                self.envelope(
                    p,
                    RankMessage::ResolveRequest {
                        claims: claims.clone(),
                    },
                )
            })
            .collect())
    }

    fn finish_resolve(&mut self) -> Result<Vec<Envelope>, MetaError> {
        self.resolve = None;
        self.state = if self.id.as_u32() >= self.max_active {
            RankState::Stopping
        } else {
            RankState::Active
        };
        self.trim_journal()?;
        tracing::info!(rank = %self.id, gid = %self.gid, state = %self.state, subtrees = self.map.owned().len(), "resolve complete");

        let mut out = Vec::new();
        let resume: Vec<(OperationId, RankId)> = self
            .exports
            .values()
            .filter(|e| e.phase.is_durable())
            .map(|e| (e.op.id, e.op.dest))
            .collect();
        for (op_id, dest) in resume {
            if self.is_peer_live(dest) {
                out.extend(self.resume_export(op_id)?);
            } else {
                tracing::info!(rank = %self.id, op = %op_id, %dest, "export waits for destination");
            }
        }
        for env in std::mem::take(&mut self.deferred) {
            out.extend(self.handle(env)?);
        }
        Ok(out)
    }

    pub(crate) fn handle_resolve_request(
        &mut self,
        from: Source,
        claims: Vec<BoundaryClaim>,
    ) -> Result<Vec<Envelope>, MetaError> {
        let Source::Rank { rank, .. } = from else {
            return Ok(Vec::new());
        };
        self.apply_claims(rank, claims)?;
        Ok(self.reply(
            from,
            RankMessage::ResolveReply {
                claims: self.map.claims(),
            },
        ))
    }

    pub(crate) fn handle_resolve_reply(
        &mut self,
        from: Source,
        claims: Vec<BoundaryClaim>,
    ) -> Result<Vec<Envelope>, MetaError> {
        let Source::Rank { rank, .. } = from else {
            return Ok(Vec::new());
        };
        self.apply_claims(rank, claims)?;
        let done = match self.resolve.as_mut() {
            Some(resolve) => {
                resolve.waiting.remove(&rank);
                resolve.waiting.is_empty()
            }
            None => false,
        };
        if done {
            self.finish_resolve()
        } else {
            Ok(Vec::new())
        }
    }

    /// A peer died mid-resolve: stop waiting for it.
    pub(crate) fn resolve_on_peer_failed(
        &mut self,
        rank: RankId,
    ) -> Result<Vec<Envelope>, MetaError> {
        let done = match self.resolve.as_mut() {
            Some(resolve) => resolve.waiting.remove(&rank) && resolve.waiting.is_empty(),
            None => false,
        };
        if done {
            self.finish_resolve()
        } else {
            Ok(Vec::new())
        }
    }

    /// Folds a peer's ownership claims into the view.
    pub(crate) fn apply_claims(
        &mut self,
        from: RankId,
        claims: Vec<BoundaryClaim>,
    ) -> Result<(), MetaError> {
        let handle = self.ns.clone();
        let ns = read_namespace(&handle)?;
        for claim in claims {
            if !ns.contains(claim.root) {
                continue;
            }
            let path = ns.path_of(claim.root)?;

            let rival = self.resolve.as_mut().and_then(|resolve| {
                match resolve.claimed.insert(claim.root, (from, claim.epoch)) {
                    Some((other, epoch)) if other != from && epoch == claim.epoch => Some(other),
                    _ => None,
                }
            });
            if let Some(other) = rival {
                self.raise_alarm(path.clone(), other, from);
            }

            let existing = self
                .map
                .get(claim.root)
                .map(|b| (b.is_owned_by(self.id), b.is_pending(), b.epoch));
            match existing {
                Some((true, _, _)) => {
                    self.raise_alarm(path, self.id, from);
                    continue;
                }
                Some((_, true, _)) => continue,
                Some((_, _, epoch)) if epoch > claim.epoch => continue,
                _ => {}
            }
            self.map.set_auth(claim.root, path, from, claim.epoch);
        }
        Ok(())
    }
}
