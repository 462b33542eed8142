//! Exporter side of subtree migration.
//!
//! Phases 1 through 7 can be abandoned: the exporter unfreezes, drops any
//! boundary it split off for the attempt, and cancels the destination and
//! warned bystanders. Phase 8 writes the start record; from then on the
//! export can only complete, even across crashes of either side. Phase 11
//! writes the finish record, at which point authority belongs to the
//! destination.

use std::collections::{BTreeSet, HashSet};

use crate::journal::JournalEvent;
use crate::messages::{BoundaryUpdate, RankMessage, SubtreePayload};
use crate::migration::{ExportPhase, MigrationOperation};
use crate::namespace::{read_namespace, Namespace};
use crate::rank::Rank;
use crate::session::SessionRecord;
use crate::subtree::{BoundaryState, SubtreeBoundary};
use crate::transport::{Envelope, Source};
use crate::types::{DirId, MetaError, MigrationSide, OperationId, RankId};

/// An export in flight.
pub(crate) struct ExportState {
    pub(crate) op: MigrationOperation,
    pub(crate) phase: ExportPhase,
    pub(crate) started_tick: u64,
    /// The root was not a boundary before this attempt
    pub(crate) created_split: bool,
    pub(crate) warned: BTreeSet<RankId>,
    pub(crate) awaiting_acks: BTreeSet<RankId>,
    pub(crate) payload: Option<SubtreePayload>,
    pub(crate) sessions: Vec<SessionRecord>,
    pub(crate) start_seq: Option<u64>,
}

impl ExportState {
    pub(crate) fn new(op: MigrationOperation, started_tick: u64) -> Self {
        Self {
            op,
            phase: ExportPhase::Discover,
            started_tick,
            created_split: false,
            warned: BTreeSet::new(),
            awaiting_acks: BTreeSet::new(),
            payload: None,
            sessions: Vec::new(),
            start_seq: None,
        }
    }
}

impl Rank {
    /// Starts exporting the subtree rooted at `root` to `dest`.
    pub fn start_export(&mut self, root: DirId, dest: RankId) -> Result<Vec<Envelope>, MetaError> {
        if !self.is_active() {
            return Err(MetaError::RankUnavailable(self.id));
        }
        let handle = self.ns.clone();
        let ns = read_namespace(&handle)?;
        let root_path = ns.path_of(root)?;
        let enclosing = self.map.enclosing(&ns, root)?;
        if !enclosing.is_owned_by(self.id) {
            return Err(MetaError::NotAuthority {
                rank: self.id,
                path: root_path.to_string(),
            });
        }
        if !self.can_export_to(dest) {
            return Err(MetaError::DestinationUnavailable(dest));
        }
        if self.overlapping_operation(&ns, root).is_some()
            || self.map.frozen_overlapping(&ns, root).is_some()
        {
            return Err(MetaError::MigrationInProgress(root_path.to_string()));
        }
        drop(ns);

        let op = MigrationOperation::new(self.id, dest, root, root_path, self.map.next_epoch());
        tracing::info!(rank = %self.id, op = %op.id, root = %op.root_path, %dest, "export started");
        let op_id = op.id;
        self.exports.insert(op_id, ExportState::new(op.clone(), self.now));
        self.kill_check(MigrationSide::Export, ExportPhase::Discover.number())?;
        Ok(vec![self.envelope(dest, RankMessage::ExportDiscover { op })])
    }

    /// An export or import whose root is at, above or below `dir`.
    pub(crate) fn overlapping_operation(&self, ns: &Namespace, dir: DirId) -> Option<OperationId> {
        let overlaps = |root: DirId| {
            ns.is_ancestor_or_self(root, dir) || ns.is_ancestor_or_self(dir, root)
        };
        self.exports
            .values()
            .map(|e| (e.op.id, e.op.root))
            .chain(self.imports.values().map(|i| (i.op.id, i.op.root)))
            .find(|(_, root)| overlaps(*root))
            .map(|(id, _)| id)
    }

    /// Like [`Rank::overlapping_operation`], but an operation whose root is
    /// separated from `dir` by a boundary in the local map does not count:
    /// the upper region stops at that boundary, so the two move independently.
    pub(crate) fn conflicting_operation(&self, ns: &Namespace, dir: DirId) -> Option<OperationId> {
        let conflicts = |root: DirId| {
            if root == dir {
                return true;
            }
            let lower = if ns.is_ancestor_or_self(root, dir) {
                dir
            } else if ns.is_ancestor_or_self(dir, root) {
                root
            } else {
                return false;
            };
            !self.map.contains(lower)
        };
        self.exports
            .values()
            .map(|e| (e.op.id, e.op.root))
            .chain(self.imports.values().map(|i| (i.op.id, i.op.root)))
            .find(|(_, root)| conflicts(*root))
            .map(|(id, _)| id)
    }

    fn enter_export_phase(&mut self, op_id: OperationId, phase: ExportPhase) {
        if let Some(state) = self.exports.get_mut(&op_id) {
            state.phase = phase;
        }
        tracing::debug!(rank = %self.id, op = %op_id, phase = phase.number(), "export phase");
    }

    fn export_phase(&self, op_id: OperationId) -> Option<ExportPhase> {
        self.exports.get(&op_id).map(|e| e.phase)
    }

    pub(crate) fn handle_discover_ack(
        &mut self,
        op_id: OperationId,
        accepted: bool,
        reason: Option<String>,
    ) -> Result<Vec<Envelope>, MetaError> {
        if self.export_phase(op_id) != Some(ExportPhase::Discover) {
            tracing::debug!(rank = %self.id, op = %op_id, "stray discover ack");
            return Ok(Vec::new());
        }
        if !accepted {
            return self.abort_export(op_id, reason.as_deref().unwrap_or("discover rejected"));
        }
        self.enter_export_phase(op_id, ExportPhase::Discovered);
        self.kill_check(MigrationSide::Export, ExportPhase::Discovered.number())?;

        self.enter_export_phase(op_id, ExportPhase::Freezing);
        self.freeze_export_root(op_id)?;
        self.kill_check(MigrationSide::Export, ExportPhase::Freezing.number())?;

        self.enter_export_phase(op_id, ExportPhase::Prepping);
        let (op, payload) = self.build_payload(op_id)?;
        self.kill_check(MigrationSide::Export, ExportPhase::Prepping.number())?;
        Ok(vec![self.envelope(
            op.dest,
            RankMessage::ExportPrep { op, payload },
        )])
    }

    /// Freezes the root, splitting it off the enclosing subtree if needed.
    fn freeze_export_root(&mut self, op_id: OperationId) -> Result<(), MetaError> {
        let (root, root_path, dest) = match self.exports.get(&op_id) {
            Some(e) => (e.op.root, e.op.root_path.clone(), e.op.dest),
            None => return Ok(()),
        };
        let created_split = if self.map.contains(root) {
            false
        } else {
            let epoch = {
                let ns = read_namespace(&self.ns)?;
                self.map.enclosing(&ns, root)?.epoch
            };
            self.map
                .insert(SubtreeBoundary::new(root, root_path, self.id, epoch));
            true
        };
        if let Some(b) = self.map.get_mut(root) {
            b.frozen = true;
            b.state = BoundaryState::Ambiguous { dest };
        }
        if let Some(state) = self.exports.get_mut(&op_id) {
            state.created_split = created_split;
        }
        Ok(())
    }

    fn build_payload(
        &mut self,
        op_id: OperationId,
    ) -> Result<(MigrationOperation, SubtreePayload), MetaError> {
        let op = self
            .exports
            .get(&op_id)
            .map(|e| e.op.clone())
            .ok_or_else(|| MetaError::NotFound(format!("export {}", op_id)))?;
        let payload = {
            let ns = read_namespace(&self.ns)?;
            SubtreePayload {
                root: op.root,
                root_path: ns.path_of(op.root)?,
                dirs: self.map.region_of(&ns, op.root)?,
                bounds: self.map.nested_bounds(&ns, op.root)?,
            }
        };
        if let Some(state) = self.exports.get_mut(&op_id) {
            state.payload = Some(payload.clone());
        }
        Ok((op, payload))
    }

    pub(crate) fn handle_prep_ack(
        &mut self,
        op_id: OperationId,
        accepted: bool,
        reason: Option<String>,
    ) -> Result<Vec<Envelope>, MetaError> {
        if self.export_phase(op_id) != Some(ExportPhase::Prepping) {
            tracing::debug!(rank = %self.id, op = %op_id, "stray prep ack");
            return Ok(Vec::new());
        }
        if !accepted {
            return self.abort_export(op_id, reason.as_deref().unwrap_or("prep rejected"));
        }
        self.enter_export_phase(op_id, ExportPhase::Prepped);
        self.kill_check(MigrationSide::Export, ExportPhase::Prepped.number())?;

        self.enter_export_phase(op_id, ExportPhase::Warning);
        let op = match self.exports.get(&op_id) {
            Some(e) => e.op.clone(),
            None => return Ok(Vec::new()),
        };
        let bystanders: BTreeSet<RankId> = self
            .live_peers()
            .into_iter()
            .filter(|r| *r != op.dest)
            .collect();
        if let Some(state) = self.exports.get_mut(&op_id) {
            state.warned = bystanders.clone();
            state.awaiting_acks = bystanders.clone();
        }
        self.kill_check(MigrationSide::Export, ExportPhase::Warning.number())?;

        if bystanders.is_empty() {
            return self.after_warnings(op_id);
        }
        Ok(bystanders
            .into_iter()
            .map(|r| self.envelope(r, RankMessage::ExportWarning { op: op.clone() }))
            .collect())
    }

    pub(crate) fn handle_warning_ack(
        &mut self,
        from: Source,
        op_id: OperationId,
    ) -> Result<Vec<Envelope>, MetaError> {
        let Source::Rank { rank, .. } = from else {
            return Ok(Vec::new());
        };
        let done = match self.exports.get_mut(&op_id) {
            Some(state) if state.phase == ExportPhase::Warning => {
                state.awaiting_acks.remove(&rank);
                state.awaiting_acks.is_empty()
            }
            _ => false,
        };
        if done {
            self.after_warnings(op_id)
        } else {
            Ok(Vec::new())
        }
    }

    /// Phases 7 through 9: every bystander has acknowledged.
    fn after_warnings(&mut self, op_id: OperationId) -> Result<Vec<Envelope>, MetaError> {
        self.enter_export_phase(op_id, ExportPhase::WarningAcked);
        self.kill_check(MigrationSide::Export, ExportPhase::WarningAcked.number())?;

        let (op, payload) = match self.exports.get(&op_id) {
            Some(ExportState {
                op,
                payload: Some(payload),
                ..
            }) => (op.clone(), payload.clone()),
            _ => return Err(MetaError::NotFound(format!("export payload {}", op_id))),
        };
        let sessions = {
            let ns = read_namespace(&self.ns)?;
            let region: HashSet<DirId> = self.map.region_of(&ns, op.root)?.into_iter().collect();
            self.sessions.collect(|d| region.contains(&d))
        };
        // Still abandonable until the start record is on disk.
        let seq = match self.journal.append(JournalEvent::ExportStart {
            op,
            payload,
            sessions: sessions.clone(),
        }) {
            Ok(seq) => seq,
            Err(e) => {
                tracing::error!(rank = %self.id, op = %op_id, error = %e, "export start record not written");
                return self.abort_export(op_id, "start record not written");
            }
        };
        self.enter_export_phase(op_id, ExportPhase::LoggingStart);
        if let Some(state) = self.exports.get_mut(&op_id) {
            state.sessions = sessions;
            state.start_seq = Some(seq);
        }
        self.kill_check(MigrationSide::Export, ExportPhase::LoggingStart.number())?;

        self.send_export_dir(op_id)
    }

    /// Phase 9. Also the resend path after the importer restarts.
    fn send_export_dir(&mut self, op_id: OperationId) -> Result<Vec<Envelope>, MetaError> {
        self.enter_export_phase(op_id, ExportPhase::Transfer);
        let Some(state) = self.exports.get(&op_id) else {
            return Ok(Vec::new());
        };
        let Some(payload) = state.payload.clone() else {
            return Err(MetaError::NotFound(format!("export payload {}", op_id)));
        };
        let message = RankMessage::ExportDir {
            op: state.op.clone(),
            payload,
            sessions: state.sessions.clone(),
        };
        let dest = state.op.dest;
        self.kill_check(MigrationSide::Export, ExportPhase::Transfer.number())?;
        Ok(vec![self.envelope(dest, message)])
    }

    pub(crate) fn handle_export_dir_ack(
        &mut self,
        op_id: OperationId,
    ) -> Result<Vec<Envelope>, MetaError> {
        if self.export_phase(op_id) != Some(ExportPhase::Transfer) {
            tracing::debug!(rank = %self.id, op = %op_id, "stray export dir ack");
            return Ok(Vec::new());
        }
        self.enter_export_phase(op_id, ExportPhase::TransferAcked);
        self.kill_check(MigrationSide::Export, ExportPhase::TransferAcked.number())?;

        let op = match self.exports.get(&op_id) {
            Some(e) => e.op.clone(),
            None => return Ok(Vec::new()),
        };
        self.journal.append(JournalEvent::ExportFinish { op_id })?;
        self.enter_export_phase(op_id, ExportPhase::LoggingFinish);
        let root_path = {
            let ns = read_namespace(&self.ns)?;
            let region: HashSet<DirId> = self.map.region_of(&ns, op.root)?.into_iter().collect();
            let moved = self.sessions.take(|d| region.contains(&d));
            tracing::debug!(rank = %self.id, op = %op_id, sessions = moved.len(), "sessions handed off");
            ns.path_of(op.root)?
        };
        self.map.set_auth(op.root, root_path, op.dest, op.epoch);
        tracing::info!(rank = %self.id, op = %op_id, root = %op.root_path, dest = %op.dest, "authority transferred");
        self.kill_check(MigrationSide::Export, ExportPhase::LoggingFinish.number())?;

        self.notify_export(op_id)
    }

    /// Phase 12: tell bystanders the new authority and the importer to finish.
    fn notify_export(&mut self, op_id: OperationId) -> Result<Vec<Envelope>, MetaError> {
        self.enter_export_phase(op_id, ExportPhase::Notify);
        let Some(op) = self.exports.get(&op_id).map(|e| e.op.clone()) else {
            return Ok(Vec::new());
        };
        let root_path = self
            .map
            .get(op.root)
            .map(|b| b.root_path.clone())
            .unwrap_or_else(|| op.root_path.clone());
        let mut out: Vec<Envelope> = self
            .live_peers()
            .into_iter()
            .filter(|r| *r != op.dest)
            .map(|r| {
                self.envelope(
                    r,
                    RankMessage::SubtreeUpdate(BoundaryUpdate {
                        root: op.root,
                        root_path: root_path.clone(),
                        auth: op.dest,
                        epoch: op.epoch,
                        removed: false,
                    }),
                )
            })
            .collect();
        out.push(self.envelope(op.dest, RankMessage::ExportFinish { op: op.clone() }));
        self.map.add_export_target(op.dest);
        self.kill_check(MigrationSide::Export, ExportPhase::Notify.number())?;
        Ok(out)
    }

    pub(crate) fn handle_export_finish_ack(
        &mut self,
        op_id: OperationId,
    ) -> Result<Vec<Envelope>, MetaError> {
        if self.export_phase(op_id) != Some(ExportPhase::Notify) {
            tracing::debug!(rank = %self.id, op = %op_id, "stray export finish ack");
            return Ok(Vec::new());
        }
        self.journal.append(JournalEvent::ExportComplete { op_id })?;
        self.enter_export_phase(op_id, ExportPhase::Finish);
        self.kill_check(MigrationSide::Export, ExportPhase::Finish.number())?;

        if let Some(state) = self.exports.remove(&op_id) {
            if let Some(b) = self.map.get_mut(state.op.root) {
                b.frozen = false;
            }
            tracing::info!(rank = %self.id, op = %op_id, root = %state.op.root_path, dest = %state.op.dest, "export complete");
        }
        self.trim_journal()?;
        Ok(Vec::new())
    }

    /// Abandons an export that has not reached its start record.
    pub(crate) fn abort_export(
        &mut self,
        op_id: OperationId,
        reason: &str,
    ) -> Result<Vec<Envelope>, MetaError> {
        let Some(state) = self.exports.remove(&op_id) else {
            return Ok(Vec::new());
        };
        if state.phase.is_durable() {
            self.exports.insert(op_id, state);
            return Err(MetaError::MigrationInProgress(format!(
                "export {} is past its point of no return",
                op_id
            )));
        }
        let root = state.op.root;
        if state.created_split {
            self.map.remove(root);
        } else if let Some(b) = self.map.get_mut(root) {
            b.frozen = false;
            b.state = BoundaryState::Stable;
        }

        let cancel = RankMessage::ExportCancel { op_id, root };
        let mut out = Vec::new();
        if self.is_peer_live(state.op.dest) {
            out.push(self.envelope(state.op.dest, cancel.clone()));
        }
        for r in &state.warned {
            if self.is_peer_live(*r) {
                out.push(self.envelope(*r, cancel.clone()));
            }
        }
        self.failed_attempts.insert(
            (root, state.op.dest),
            self.now + self.config.retry_backoff_ticks,
        );
        tracing::warn!(
            rank = %self.id,
            op = %op_id,
            root = %state.op.root_path,
            dest = %state.op.dest,
            phase = state.phase.number(),
            reason,
            "export aborted"
        );
        Ok(out)
    }

    /// Times out exports stuck before their point of no return.
    pub(crate) fn expire_exports(&mut self) -> Result<Vec<Envelope>, MetaError> {
        let expired: Vec<OperationId> = self
            .exports
            .values()
            .filter(|e| {
                !e.phase.is_durable()
                    && self.now.saturating_sub(e.started_tick) >= self.config.export_timeout_ticks
            })
            .map(|e| e.op.id)
            .collect();
        let mut out = Vec::new();
        for op_id in expired {
            out.extend(self.abort_export(op_id, "timed out")?);
        }
        Ok(out)
    }

    /// A peer died: abandon early exports to it and stop waiting on its acks.
    pub(crate) fn exports_on_peer_failed(
        &mut self,
        rank: RankId,
    ) -> Result<Vec<Envelope>, MetaError> {
        let mut out = Vec::new();
        let to_abort: Vec<OperationId> = self
            .exports
            .values()
            .filter(|e| e.op.dest == rank && !e.phase.is_durable())
            .map(|e| e.op.id)
            .collect();
        for op_id in to_abort {
            out.extend(self.abort_export(op_id, "destination failed")?);
        }
        for e in self.exports.values().filter(|e| e.op.dest == rank) {
            tracing::info!(rank = %self.id, op = %e.op.id, phase = e.phase.number(), "waiting for destination to return");
        }

        let mut unblocked = Vec::new();
        for e in self.exports.values_mut() {
            if e.phase == ExportPhase::Warning
                && e.awaiting_acks.remove(&rank)
                && e.awaiting_acks.is_empty()
            {
                unblocked.push(e.op.id);
            }
        }
        for op_id in unblocked {
            out.extend(self.after_warnings(op_id)?);
        }
        Ok(out)
    }

    /// A peer came back: resend whatever a committed export still owes it.
    pub(crate) fn exports_on_peer_up(&mut self, rank: RankId) -> Result<Vec<Envelope>, MetaError> {
        let resume: Vec<OperationId> = self
            .exports
            .values()
            .filter(|e| e.op.dest == rank && e.phase.is_durable())
            .map(|e| e.op.id)
            .collect();
        let mut out = Vec::new();
        for op_id in resume {
            out.extend(self.resume_export(op_id)?);
        }
        Ok(out)
    }

    /// Re-drives a committed export from its last durable record.
    pub(crate) fn resume_export(&mut self, op_id: OperationId) -> Result<Vec<Envelope>, MetaError> {
        let Some(phase) = self.export_phase(op_id) else {
            return Ok(Vec::new());
        };
        tracing::info!(rank = %self.id, op = %op_id, phase = phase.number(), "resuming export");
        if phase < ExportPhase::LoggingFinish {
            self.send_export_dir(op_id)
        } else {
            self.notify_export(op_id)
        }
    }

    /// Bystander side: an export of `op.root` is in flight.
    pub(crate) fn handle_warning(
        &mut self,
        from: Source,
        op: MigrationOperation,
    ) -> Result<Vec<Envelope>, MetaError> {
        let path = {
            let ns = read_namespace(&self.ns)?;
            ns.path_of(op.root).unwrap_or_else(|_| op.root_path.clone())
        };
        let dest = op.dest;
        match self.map.get_mut(op.root) {
            Some(b) => {
                if !b.is_owned_by(self.id) && !b.is_pending() {
                    b.state = BoundaryState::Ambiguous { dest };
                }
            }
            None => {
                let mut b = SubtreeBoundary::new(
                    op.root,
                    path,
                    op.source,
                    op.epoch.saturating_sub(1),
                );
                b.state = BoundaryState::Ambiguous { dest };
                self.map.insert(b);
            }
        }
        tracing::debug!(rank = %self.id, op = %op.id, root = %op.root_path, "export warning acknowledged");
        Ok(self.reply(from, RankMessage::ExportWarningAck { op_id: op.id }))
    }
}
