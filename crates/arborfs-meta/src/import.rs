//! Importer side of subtree migration.
//!
//! The importer holds a pending boundary from prep until finish. Requests
//! for directories under it are queued rather than served or bounced. Until
//! phase 6 writes the start record an import can be discarded; afterwards
//! only the exporter's finish settles it.

use crate::journal::JournalEvent;
use crate::messages::{RankMessage, SubtreePayload};
use crate::migration::{ImportPhase, MigrationOperation};
use crate::namespace::{read_namespace, DirPath};
use crate::rank::Rank;
use crate::session::SessionRecord;
use crate::subtree::{BoundaryState, SubtreeBoundary};
use crate::topology::RankState;
use crate::transport::{Envelope, Source};
use crate::types::{DirId, MetaError, MigrationSide, OperationId, RankId};

/// An import in flight.
pub(crate) struct ImportState {
    pub(crate) op: MigrationOperation,
    pub(crate) phase: ImportPhase,
    pub(crate) payload: Option<SubtreePayload>,
    pub(crate) sessions: Vec<SessionRecord>,
    pub(crate) start_seq: Option<u64>,
    /// What the map held at the root before the pending boundary went in
    pub(crate) prev_boundary: Option<SubtreeBoundary>,
}

impl ImportState {
    pub(crate) fn new(op: MigrationOperation) -> Self {
        Self {
            op,
            phase: ImportPhase::Discovering,
            payload: None,
            sessions: Vec::new(),
            start_seq: None,
            prev_boundary: None,
        }
    }
}

impl Rank {
    fn enter_import_phase(&mut self, op_id: OperationId, phase: ImportPhase) {
        if let Some(state) = self.imports.get_mut(&op_id) {
            state.phase = phase;
        }
        tracing::debug!(rank = %self.id, op = %op_id, phase = phase.number(), "import phase");
    }

    fn import_phase(&self, op_id: OperationId) -> Option<ImportPhase> {
        self.imports.get(&op_id).map(|i| i.phase)
    }

    /// Why this rank cannot take `op` right now, if it cannot.
    fn discover_refusal(&self, op: &MigrationOperation) -> Result<Option<String>, MetaError> {
        if self.state != RankState::Active {
            return Ok(Some(format!("rank {} is {}", self.id, self.state)));
        }
        if op.dest != self.id {
            return Ok(Some(format!("operation is addressed to rank {}", op.dest)));
        }
        let ns = read_namespace(&self.ns)?;
        if !ns.contains(op.root) {
            return Ok(Some(format!("no directory {}", op.root_path)));
        }
        let busy = self
            .conflicting_operation(&ns, op.root)
            .filter(|id| *id != op.id);
        if busy.is_some() {
            return Ok(Some(format!("migration in progress near {}", op.root_path)));
        }
        Ok(None)
    }

    pub(crate) fn handle_discover(
        &mut self,
        from: Source,
        op: MigrationOperation,
    ) -> Result<Vec<Envelope>, MetaError> {
        let op_id = op.id;
        if self.imports.contains_key(&op_id) {
            return Ok(self.reply(
                from,
                RankMessage::ExportDiscoverAck {
                    op_id,
                    accepted: true,
                    reason: None,
                },
            ));
        }
        self.imports.insert(op_id, ImportState::new(op.clone()));
        self.kill_check(MigrationSide::Import, ImportPhase::Discovering.number())?;

        if let Some(reason) = self.discover_refusal(&op)? {
            self.imports.remove(&op_id);
            tracing::info!(rank = %self.id, op = %op_id, root = %op.root_path, %reason, "import refused");
            return Ok(self.reply(
                from,
                RankMessage::ExportDiscoverAck {
                    op_id,
                    accepted: false,
                    reason: Some(reason),
                },
            ));
        }
        self.enter_import_phase(op_id, ImportPhase::Discovered);
        self.kill_check(MigrationSide::Import, ImportPhase::Discovered.number())?;
        Ok(self.reply(
            from,
            RankMessage::ExportDiscoverAck {
                op_id,
                accepted: true,
                reason: None,
            },
        ))
    }

    pub(crate) fn handle_prep(
        &mut self,
        from: Source,
        op: MigrationOperation,
        payload: SubtreePayload,
    ) -> Result<Vec<Envelope>, MetaError> {
        let op_id = op.id;
        let refuse = |rank: &Rank, reason: String| {
            tracing::info!(rank = %rank.id, op = %op_id, %reason, "prep refused");
            rank.reply(
                from,
                RankMessage::ExportPrepAck {
                    op_id,
                    accepted: false,
                    reason: Some(reason),
                },
            )
        };
        match self.import_phase(op_id) {
            Some(ImportPhase::Discovered) => {}
            Some(phase) if phase >= ImportPhase::Prepped => {
                return Ok(self.reply(
                    from,
                    RankMessage::ExportPrepAck {
                        op_id,
                        accepted: true,
                        reason: None,
                    },
                ));
            }
            _ => return Ok(refuse(&*self, "unknown operation".into())),
        }

        self.enter_import_phase(op_id, ImportPhase::Prepping);
        self.kill_check(MigrationSide::Import, ImportPhase::Prepping.number())?;

        let root_path = {
            let ns = read_namespace(&self.ns)?;
            if !ns.contains(op.root) || payload.dirs.iter().any(|d| !ns.contains(*d)) {
                None
            } else {
                Some(ns.path_of(op.root)?)
            }
        };
        let Some(root_path) = root_path else {
            self.imports.remove(&op_id);
            return Ok(refuse(&*self, format!("{} changed under the export", op.root_path)));
        };
        if let Some(existing) = self.map.get(op.root) {
            let reason = match &existing.state {
                BoundaryState::Pending { op: other } if *other != op_id => {
                    Some(format!("{} already pending under {}", root_path, other))
                }
                _ if existing.is_owned_by(self.id) => {
                    Some(format!("rank {} already holds {}", self.id, root_path))
                }
                _ => None,
            };
            if let Some(reason) = reason {
                self.imports.remove(&op_id);
                return Ok(refuse(&*self, reason));
            }
        }

        self.install_pending(&op, root_path);
        if let Some(state) = self.imports.get_mut(&op_id) {
            state.payload = Some(payload);
        }
        self.enter_import_phase(op_id, ImportPhase::Prepped);
        self.kill_check(MigrationSide::Import, ImportPhase::Prepped.number())?;
        Ok(self.reply(
            from,
            RankMessage::ExportPrepAck {
                op_id,
                accepted: true,
                reason: None,
            },
        ))
    }

    /// Puts a pending, frozen boundary at the import root, remembering
    /// whatever entry it replaces.
    pub(crate) fn install_pending(&mut self, op: &MigrationOperation, root_path: DirPath) {
        let prev = self.map.get(op.root).cloned();
        let epoch = prev
            .as_ref()
            .map(|b| b.epoch)
            .unwrap_or_else(|| op.epoch.saturating_sub(1));
        let mut pending = SubtreeBoundary::new(op.root, root_path, op.source, epoch);
        pending.state = BoundaryState::Pending { op: op.id };
        pending.frozen = true;
        self.map.insert(pending);
        if let Some(state) = self.imports.get_mut(&op.id) {
            state.prev_boundary = prev;
        }
    }

    pub(crate) fn handle_export_dir(
        &mut self,
        from: Source,
        op: MigrationOperation,
        payload: SubtreePayload,
        sessions: Vec<SessionRecord>,
    ) -> Result<Vec<Envelope>, MetaError> {
        let op_id = op.id;
        let ack = RankMessage::ExportDirAck { op_id };
        match self.import_phase(op_id) {
            Some(phase) if phase.is_durable() => return Ok(self.reply(from, ack)),
            Some(ImportPhase::Prepped) => {}
            Some(phase) => {
                tracing::warn!(rank = %self.id, op = %op_id, phase = phase.number(), "export dir before prep");
                return Ok(Vec::new());
            }
            None => {
                // A resend after this rank lost its volatile import state, or
                // after it already finished the import.
                if let Some(b) = self.map.get(op.root) {
                    if b.is_owned_by(self.id) && b.epoch >= op.epoch {
                        return Ok(self.reply(from, ack));
                    }
                }
                let root_path = {
                    let ns = read_namespace(&self.ns)?;
                    ns.path_of(op.root)?
                };
                self.imports.insert(op_id, ImportState::new(op.clone()));
                self.install_pending(&op, root_path);
                self.enter_import_phase(op_id, ImportPhase::Prepped);
            }
        }

        self.enter_import_phase(op_id, ImportPhase::Receiving);
        self.kill_check(MigrationSide::Import, ImportPhase::Receiving.number())?;

        let seq = self.journal.append(JournalEvent::ImportStart {
            op,
            payload: payload.clone(),
            sessions: sessions.clone(),
        })?;
        self.enter_import_phase(op_id, ImportPhase::LoggingStart);
        if let Some(state) = self.imports.get_mut(&op_id) {
            state.payload = Some(payload);
            state.start_seq = Some(seq);
        }
        self.kill_check(MigrationSide::Import, ImportPhase::LoggingStart.number())?;

        self.enter_import_phase(op_id, ImportPhase::Acking);
        let staged = sessions.len();
        if let Some(state) = self.imports.get_mut(&op_id) {
            state.sessions = sessions;
        }
        tracing::debug!(rank = %self.id, op = %op_id, sessions = staged, "sessions staged");
        self.kill_check(MigrationSide::Import, ImportPhase::Acking.number())?;

        self.enter_import_phase(op_id, ImportPhase::Acked);
        self.kill_check(MigrationSide::Import, ImportPhase::Acked.number())?;
        Ok(self.reply(from, ack))
    }

    pub(crate) fn handle_export_finish(
        &mut self,
        from: Source,
        op: MigrationOperation,
    ) -> Result<Vec<Envelope>, MetaError> {
        let op_id = op.id;
        let ack = RankMessage::ExportFinishAck { op_id };
        match self.import_phase(op_id) {
            None => {
                tracing::debug!(rank = %self.id, op = %op_id, "finish for settled import");
                return Ok(self.reply(from, ack));
            }
            Some(ImportPhase::Acked) => {}
            Some(phase) => {
                tracing::warn!(rank = %self.id, op = %op_id, phase = phase.number(), "finish out of order");
                return Ok(Vec::new());
            }
        }

        self.enter_import_phase(op_id, ImportPhase::Finishing);
        self.kill_check(MigrationSide::Import, ImportPhase::Finishing.number())?;

        self.journal.append(JournalEvent::ImportFinish { op_id })?;
        self.enter_import_phase(op_id, ImportPhase::LoggingFinish);
        let root_path = {
            let ns = read_namespace(&self.ns)?;
            ns.path_of(op.root)?
        };
        let b = self.map.set_auth(op.root, root_path, self.id, op.epoch);
        b.frozen = false;
        tracing::info!(rank = %self.id, op = %op_id, root = %op.root_path, source = %op.source, "authority acquired");
        self.kill_check(MigrationSide::Import, ImportPhase::LoggingFinish.number())?;

        self.enter_import_phase(op_id, ImportPhase::Sessions);
        let staged = self
            .imports
            .get_mut(&op_id)
            .map(|s| std::mem::take(&mut s.sessions))
            .unwrap_or_default();
        for record in staged {
            self.sessions.install(record);
        }
        let released = self.sessions.release(op.root);
        let mut out = self.route_requests(released)?;
        self.kill_check(MigrationSide::Import, ImportPhase::Sessions.number())?;

        self.enter_import_phase(op_id, ImportPhase::Confirmed);
        self.kill_check(MigrationSide::Import, ImportPhase::Confirmed.number())?;
        out.extend(self.reply(from, ack));

        self.enter_import_phase(op_id, ImportPhase::Finish);
        self.imports.remove(&op_id);
        self.kill_check(MigrationSide::Import, ImportPhase::Finish.number())?;
        self.trim_journal()?;
        tracing::info!(rank = %self.id, op = %op_id, root = %op.root_path, "import complete");
        Ok(out)
    }

    /// Drops an import that has not reached its start record.
    pub(crate) fn discard_import(
        &mut self,
        op_id: OperationId,
        reason: &str,
    ) -> Result<Vec<Envelope>, MetaError> {
        let Some(state) = self.imports.remove(&op_id) else {
            return Ok(Vec::new());
        };
        if state.phase.is_durable() {
            tracing::debug!(rank = %self.id, op = %op_id, "keeping committed import");
            self.imports.insert(op_id, state);
            return Ok(Vec::new());
        }
        let root = state.op.root;
        let ours = matches!(
            self.map.get(root).map(|b| &b.state),
            Some(BoundaryState::Pending { op }) if *op == op_id
        );
        if ours {
            match state.prev_boundary {
                Some(prev) => {
                    self.map.insert(prev);
                }
                None => {
                    self.map.remove(root);
                }
            }
        }
        tracing::warn!(rank = %self.id, op = %op_id, root = %state.op.root_path, phase = state.phase.number(), reason, "import discarded");
        let released = self.sessions.release(root);
        self.route_requests(released)
    }

    /// Importer discards; bystanders clear their marker.
    pub(crate) fn handle_cancel(
        &mut self,
        op_id: OperationId,
        root: DirId,
    ) -> Result<Vec<Envelope>, MetaError> {
        if self.imports.contains_key(&op_id) {
            return self.discard_import(op_id, "cancelled by exporter");
        }
        if let Some(b) = self.map.get_mut(root) {
            if matches!(b.state, BoundaryState::Ambiguous { .. }) {
                b.state = BoundaryState::Stable;
            }
        }
        Ok(Vec::new())
    }

    /// The exporter died: discard imports it can no longer commit.
    pub(crate) fn imports_on_peer_failed(
        &mut self,
        rank: RankId,
    ) -> Result<Vec<Envelope>, MetaError> {
        let dead: Vec<OperationId> = self
            .imports
            .values()
            .filter(|i| i.op.source == rank && !i.phase.is_durable())
            .map(|i| i.op.id)
            .collect();
        let mut out = Vec::new();
        for op_id in dead {
            out.extend(self.discard_import(op_id, "exporter failed")?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failpoint::NoopInjector;
    use crate::journal::{FailingStore, JournalStore, MemoryJournalStore};
    use crate::namespace::{DirPath, Namespace};
    use crate::rank::RankConfig;
    use crate::recovery::RankStart;
    use crate::session::SessionRequest;
    use crate::types::{ClientId, DaemonGid};
    use std::sync::Arc;

    fn importer() -> (Rank, DirId) {
        importer_on(Arc::new(MemoryJournalStore::new()))
    }

    fn importer_on(store: Arc<dyn JournalStore>) -> (Rank, DirId) {
        let ns = Namespace::shared();
        let dir = ns
            .write()
            .unwrap()
            .mkdir_p(&DirPath::parse("/data/x").unwrap())
            .unwrap();
        let (mut rank, _) = Rank::start(RankStart {
            id: RankId::new(1),
            gid: DaemonGid::new(11),
            ns,
            store,
            injector: Box::new(NoopInjector),
            peers: Vec::new(),
            max_active: 2,
            config: RankConfig::default(),
        })
        .unwrap();
        rank.state = RankState::Active;
        (rank, dir)
    }

    fn exporter() -> Source {
        Source::Rank {
            rank: RankId::ZERO,
            gid: DaemonGid::new(10),
        }
    }

    fn op_for(dir: DirId) -> MigrationOperation {
        MigrationOperation::new(RankId::ZERO, RankId::new(1), dir, DirPath::parse("/data/x").unwrap(), 3)
    }

    fn payload(dir: DirId) -> SubtreePayload {
        SubtreePayload {
            root: dir,
            root_path: DirPath::parse("/data/x").unwrap(),
            dirs: vec![dir],
            bounds: Vec::new(),
        }
    }

    #[test]
    fn test_discover_refused_for_other_rank() {
        let (mut rank, dir) = importer();
        let mut op = op_for(dir);
        op.dest = RankId::new(2);
        let out = rank.handle_discover(exporter(), op).unwrap();
        assert!(matches!(
            out[0].message,
            RankMessage::ExportDiscoverAck { accepted: false, .. }
        ));
        assert!(!rank.has_operations());
    }

    #[test]
    fn test_full_import_sequence() {
        let (mut rank, dir) = importer();
        let op = op_for(dir);
        rank.handle_discover(exporter(), op.clone()).unwrap();
        let out = rank.handle_prep(exporter(), op.clone(), payload(dir)).unwrap();
        assert!(matches!(
            out[0].message,
            RankMessage::ExportPrepAck { accepted: true, .. }
        ));
        assert!(rank.map.get(dir).unwrap().is_pending());

        let req = SessionRequest {
            client: ClientId::new(4),
            dir,
            path: DirPath::parse("/data/x").unwrap(),
            hops: 1,
        };
        rank.route_requests(vec![req]).unwrap();
        assert_eq!(rank.sessions.queued_count(), 1);

        let out = rank
            .handle_export_dir(exporter(), op.clone(), payload(dir), Vec::new())
            .unwrap();
        assert!(matches!(out[0].message, RankMessage::ExportDirAck { .. }));
        let again = rank
            .handle_export_dir(exporter(), op.clone(), payload(dir), Vec::new())
            .unwrap();
        assert_eq!(again.len(), 1);

        let out = rank.handle_export_finish(exporter(), op.clone()).unwrap();
        assert!(out
            .iter()
            .any(|e| matches!(e.message, RankMessage::ExportFinishAck { .. })));
        assert!(rank.is_authoritative(dir).unwrap());
        assert!(rank.sessions.is_established(ClientId::new(4), dir));
        assert!(!rank.has_operations());

        let dup = rank.handle_export_finish(exporter(), op).unwrap();
        assert!(matches!(dup[0].message, RankMessage::ExportFinishAck { .. }));
    }

    #[test]
    fn test_cancel_restores_previous_boundary() {
        let (mut rank, dir) = importer();
        rank.map
            .insert(SubtreeBoundary::new(dir, DirPath::parse("/data/x").unwrap(), RankId::ZERO, 2));
        let op = op_for(dir);
        rank.handle_discover(exporter(), op.clone()).unwrap();
        rank.handle_prep(exporter(), op.clone(), payload(dir)).unwrap();
        rank.handle_cancel(op.id, dir).unwrap();
        let b = rank.map.get(dir).unwrap();
        assert_eq!(b.auth, RankId::ZERO);
        assert_eq!(b.state, BoundaryState::Stable);
        assert!(!b.frozen);
    }

    #[test]
    fn test_committed_import_survives_exporter_failure() {
        let (mut rank, dir) = importer();
        let op = op_for(dir);
        rank.handle_discover(exporter(), op.clone()).unwrap();
        rank.handle_prep(exporter(), op.clone(), payload(dir)).unwrap();
        rank.handle_export_dir(exporter(), op.clone(), payload(dir), Vec::new())
            .unwrap();
        rank.imports_on_peer_failed(RankId::ZERO).unwrap();
        assert!(rank.has_operations());
        assert!(rank.map.get(dir).unwrap().is_pending());
    }

    #[test]
    fn test_unwritten_import_start_stays_discardable() {
        let store = Arc::new(FailingStore::wrap(Arc::new(MemoryJournalStore::new())));
        let (mut rank, dir) = importer_on(store.clone());
        let op = op_for(dir);
        rank.handle_discover(exporter(), op.clone()).unwrap();
        rank.handle_prep(exporter(), op.clone(), payload(dir)).unwrap();

        store.set_failing(true);
        let err = rank
            .handle_export_dir(exporter(), op.clone(), payload(dir), Vec::new())
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(rank.import_phase(op.id), Some(ImportPhase::Receiving));
        let logged = rank.journal.entries().unwrap();
        assert!(!logged
            .iter()
            .any(|e| matches!(e.event, JournalEvent::ImportStart { .. })));

        rank.imports_on_peer_failed(RankId::ZERO).unwrap();
        assert!(!rank.has_operations());
        assert!(!rank.map.contains(dir));
    }

    /// Rank 1 is exporting `/data/x/y` to rank 0 when rank 0 offers it `/data/x`.
    fn crossing_export(rank: &mut Rank, parent: DirId) -> DirId {
        let path = DirPath::parse("/data/x/y").unwrap();
        let nested = rank.ns.write().unwrap().mkdir_p(&path).unwrap();
        let ours = MigrationOperation::new(RankId::new(1), RankId::ZERO, nested, path, 4);
        rank.exports
            .insert(ours.id, crate::export::ExportState::new(ours, 0));
        assert_ne!(nested, parent);
        nested
    }

    #[test]
    fn test_discover_accepted_across_nested_boundary() {
        let (mut rank, dir) = importer();
        let nested = crossing_export(&mut rank, dir);
        rank.map.insert(SubtreeBoundary::new(
            nested,
            DirPath::parse("/data/x/y").unwrap(),
            RankId::new(1),
            2,
        ));
        let out = rank.handle_discover(exporter(), op_for(dir)).unwrap();
        assert!(matches!(
            out[0].message,
            RankMessage::ExportDiscoverAck { accepted: true, .. }
        ));
    }

    #[test]
    fn test_discover_refused_inside_same_region() {
        let (mut rank, dir) = importer();
        crossing_export(&mut rank, dir);
        let out = rank.handle_discover(exporter(), op_for(dir)).unwrap();
        assert!(matches!(
            out[0].message,
            RankMessage::ExportDiscoverAck { accepted: false, .. }
        ));
        assert_eq!(rank.imports.len(), 0);
    }
}
