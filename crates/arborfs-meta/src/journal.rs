//! Per-rank migration journal.
//!
//! Every durable step of a migration is a journal record: the start and
//! finish of each side, the exporter's completion marker, and periodic
//! checkpoints of the subtree map. A successor incarnation of the rank reads
//! the journal front to back to rebuild the map and the operations that were
//! still open.
//!
//! The journal is append-only and supports:
//! - Appending records with monotonic sequence numbers
//! - Reading everything back for replay
//! - Trimming the prefix that no open operation needs

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::messages::SubtreePayload;
use crate::migration::MigrationOperation;
use crate::namespace::DirPath;
use crate::session::SessionRecord;
use crate::subtree::SubtreeBoundary;
use crate::types::{DirId, MetaError, OperationId, RankId, Timestamp};

/// A durable journal record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JournalEvent {
    /// Checkpoint of the subtree map.
    SubtreeMap {
        /// Settled boundaries at checkpoint time
        boundaries: Vec<SubtreeBoundary>,
    },
    /// Exporter's point of no return.
    ExportStart {
        /// The attempt
        op: MigrationOperation,
        /// Region metadata
        payload: SubtreePayload,
        /// Sessions moving with the subtree
        sessions: Vec<SessionRecord>,
    },
    /// Exporter gave up authority.
    ExportFinish {
        /// The attempt
        op_id: OperationId,
    },
    /// Importer confirmed; terminal for the exporter.
    ExportComplete {
        /// The attempt
        op_id: OperationId,
    },
    /// Importer's point of no return.
    ImportStart {
        /// The attempt
        op: MigrationOperation,
        /// Region metadata
        payload: SubtreePayload,
        /// Sessions moving with the subtree
        sessions: Vec<SessionRecord>,
    },
    /// Importer became authoritative; terminal for the importer.
    ImportFinish {
        /// The attempt
        op_id: OperationId,
    },
}

impl JournalEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            JournalEvent::SubtreeMap { .. } => "subtree_map",
            JournalEvent::ExportStart { .. } => "export_start",
            JournalEvent::ExportFinish { .. } => "export_finish",
            JournalEvent::ExportComplete { .. } => "export_complete",
            JournalEvent::ImportStart { .. } => "import_start",
            JournalEvent::ImportFinish { .. } => "import_finish",
        }
    }
}

/// A journal record with its sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When the record was written.
    pub recorded_at: Timestamp,
    /// The record.
    pub event: JournalEvent,
}

/// Durable storage behind a journal. Outlives the rank process that writes it.
pub trait JournalStore: Send + Sync {
    /// Durably appends one entry.
    fn append(&self, entry: &JournalEntry) -> Result<(), MetaError>;

    /// Reads every entry in order.
    fn read_all(&self) -> Result<Vec<JournalEntry>, MetaError>;

    /// Drops entries with a sequence below `sequence`. Returns how many were dropped.
    fn truncate_before(&self, sequence: u64) -> Result<usize, MetaError>;
}

/// In-memory store, for tests and for clusters run without a journal directory.
#[derive(Default)]
pub struct MemoryJournalStore {
    entries: RwLock<Vec<JournalEntry>>,
}

impl MemoryJournalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl JournalStore for MemoryJournalStore {
    fn append(&self, entry: &JournalEntry) -> Result<(), MetaError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| MetaError::JournalError(e.to_string()))?;
        entries.push(entry.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<JournalEntry>, MetaError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| MetaError::JournalError(e.to_string()))?;
        Ok(entries.clone())
    }

    fn truncate_before(&self, sequence: u64) -> Result<usize, MetaError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| MetaError::JournalError(e.to_string()))?;
        let before = entries.len();
        entries.retain(|e| e.sequence >= sequence);
        Ok(before - entries.len())
    }
}

/// File-backed store: length-prefixed bincode records, synced on every append.
pub struct FileJournalStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournalStore {
    /// Opens or creates the journal file at `path`.
    pub fn open(path: &Path) -> Result<Self, MetaError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Location of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(file: &mut File, entry: &JournalEntry) -> Result<(), MetaError> {
        let encoded =
            bincode::serialize(entry).map_err(|e| MetaError::CodecError(e.to_string()))?;
        let len_bytes = (encoded.len() as u32).to_le_bytes();
        file.write_all(&len_bytes)?;
        file.write_all(&encoded)?;
        Ok(())
    }

    fn parse(path: &Path, contents: &[u8]) -> Result<Vec<JournalEntry>, MetaError> {
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < contents.len() {
            if offset + 4 > contents.len() {
                tracing::warn!(path = %path.display(), offset, "torn length prefix at journal tail");
                break;
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&contents[offset..offset + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            offset += 4;
            if offset + len > contents.len() {
                tracing::warn!(path = %path.display(), offset, "torn record at journal tail");
                break;
            }
            let entry: JournalEntry = bincode::deserialize(&contents[offset..offset + len])
                .map_err(|e| MetaError::JournalError(format!("corrupt journal record: {}", e)))?;
            entries.push(entry);
            offset += len;
        }
        Ok(entries)
    }
}

impl JournalStore for FileJournalStore {
    fn append(&self, entry: &JournalEntry) -> Result<(), MetaError> {
        let mut file = self
            .file
            .lock()
            .map_err(|e| MetaError::JournalError(e.to_string()))?;
        Self::write_record(&mut file, entry)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<JournalEntry>, MetaError> {
        let _guard = self
            .file
            .lock()
            .map_err(|e| MetaError::JournalError(e.to_string()))?;
        let mut contents = Vec::new();
        File::open(&self.path)?.read_to_end(&mut contents)?;
        Self::parse(&self.path, &contents)
    }

    fn truncate_before(&self, sequence: u64) -> Result<usize, MetaError> {
        let mut file = self
            .file
            .lock()
            .map_err(|e| MetaError::JournalError(e.to_string()))?;
        let mut contents = Vec::new();
        File::open(&self.path)?.read_to_end(&mut contents)?;
        let entries = Self::parse(&self.path, &contents)?;
        let before = entries.len();

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp = File::create(&temp_path)?;
            for entry in entries.iter().filter(|e| e.sequence >= sequence) {
                Self::write_record(&mut temp, entry)?;
            }
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        *file = OpenOptions::new().append(true).open(&self.path)?;

        Ok(before - entries.iter().filter(|e| e.sequence >= sequence).count())
    }
}

/// An export whose start record has no completion marker.
#[derive(Clone, Debug)]
pub struct OpenExport {
    /// The attempt
    pub op: MigrationOperation,
    /// Region metadata from the start record
    pub payload: SubtreePayload,
    /// Sessions from the start record
    pub sessions: Vec<SessionRecord>,
    /// Sequence of the start record
    pub start_seq: u64,
    /// True if the finish record was written
    pub finished: bool,
}

/// An import whose start record has no finish record.
#[derive(Clone, Debug)]
pub struct OpenImport {
    /// The attempt
    pub op: MigrationOperation,
    /// Region metadata from the start record
    pub payload: SubtreePayload,
    /// Sessions from the start record
    pub sessions: Vec<SessionRecord>,
    /// Sequence of the start record
    pub start_seq: u64,
}

/// Authority change recorded after the last checkpoint.
#[derive(Clone, Debug)]
pub struct AuthorityChange {
    /// Subtree root
    pub root: DirId,
    /// Root path recorded with the operation
    pub root_path: DirPath,
    /// New authority
    pub auth: RankId,
    /// Epoch of the change
    pub epoch: u64,
    /// Sessions to install when this rank became the authority
    pub sessions: Vec<SessionRecord>,
}

/// What a journal scan yields.
#[derive(Clone, Debug, Default)]
pub struct JournalReplay {
    /// Boundaries of the last checkpoint
    pub checkpoint: Option<Vec<SubtreeBoundary>>,
    /// Authority changes after that checkpoint, in order
    pub changes: Vec<AuthorityChange>,
    /// Exports to resume
    pub exports: Vec<OpenExport>,
    /// Imports to restore
    pub imports: Vec<OpenImport>,
    /// Number of records read
    pub records: usize,
}

/// The journal of one rank.
pub struct MigrationJournal {
    store: Arc<dyn JournalStore>,
    next_sequence: u64,
}

impl MigrationJournal {
    /// Opens a journal over a store, continuing its sequence.
    pub fn open(store: Arc<dyn JournalStore>) -> Result<Self, MetaError> {
        let next_sequence = store
            .read_all()?
            .last()
            .map(|e| e.sequence + 1)
            .unwrap_or(1);
        Ok(Self {
            store,
            next_sequence,
        })
    }

    /// Durably appends a record. Returns its sequence number.
    pub fn append(&mut self, event: JournalEvent) -> Result<u64, MetaError> {
        let sequence = self.next_sequence;
        let entry = JournalEntry {
            sequence,
            recorded_at: Timestamp::now(),
            event,
        };
        self.store.append(&entry)?;
        self.next_sequence += 1;
        tracing::trace!(sequence, event = entry.event.name(), "journal append");
        Ok(sequence)
    }

    /// Every record currently in the journal.
    pub fn entries(&self) -> Result<Vec<JournalEntry>, MetaError> {
        self.store.read_all()
    }

    /// Appends a checkpoint of the subtree map.
    pub fn checkpoint(&mut self, boundaries: Vec<SubtreeBoundary>) -> Result<u64, MetaError> {
        self.append(JournalEvent::SubtreeMap { boundaries })
    }

    /// Writes a checkpoint and drops every record that neither it nor an
    /// open operation (identified by its start sequence) still needs.
    pub fn trim(
        &mut self,
        boundaries: Vec<SubtreeBoundary>,
        open_starts: impl IntoIterator<Item = u64>,
    ) -> Result<usize, MetaError> {
        let cp_seq = self.checkpoint(boundaries)?;
        let keep_from = open_starts.into_iter().fold(cp_seq, u64::min);
        let dropped = self.store.truncate_before(keep_from)?;
        tracing::debug!(keep_from, dropped, "journal trimmed");
        Ok(dropped)
    }

    /// Scans the journal for recovery.
    pub fn replay(&self) -> Result<JournalReplay, MetaError> {
        let entries = self.entries()?;
        let cp_idx = entries
            .iter()
            .rposition(|e| matches!(e.event, JournalEvent::SubtreeMap { .. }));

        let mut replay = JournalReplay {
            records: entries.len(),
            ..JournalReplay::default()
        };
        let mut export_finished = HashSet::new();
        let mut export_complete = HashSet::new();
        let mut import_finished = HashSet::new();

        for (idx, entry) in entries.iter().enumerate() {
            let after_cp = cp_idx.map_or(true, |cp| idx > cp);
            match &entry.event {
                JournalEvent::SubtreeMap { boundaries } => {
                    if Some(idx) == cp_idx {
                        replay.checkpoint = Some(boundaries.clone());
                    }
                }
                JournalEvent::ExportStart {
                    op,
                    payload,
                    sessions,
                } => replay.exports.push(OpenExport {
                    op: op.clone(),
                    payload: payload.clone(),
                    sessions: sessions.clone(),
                    start_seq: entry.sequence,
                    finished: false,
                }),
                JournalEvent::ExportFinish { op_id } => {
                    export_finished.insert(*op_id);
                    if let Some(open) = replay.exports.iter().find(|x| x.op.id == *op_id) {
                        if after_cp {
                            replay.changes.push(AuthorityChange {
                                root: open.op.root,
                                root_path: open.op.root_path.clone(),
                                auth: open.op.dest,
                                epoch: open.op.epoch,
                                sessions: Vec::new(),
                            });
                        }
                    }
                }
                JournalEvent::ExportComplete { op_id } => {
                    export_complete.insert(*op_id);
                }
                JournalEvent::ImportStart {
                    op,
                    payload,
                    sessions,
                } => replay.imports.push(OpenImport {
                    op: op.clone(),
                    payload: payload.clone(),
                    sessions: sessions.clone(),
                    start_seq: entry.sequence,
                }),
                JournalEvent::ImportFinish { op_id } => {
                    import_finished.insert(*op_id);
                    if let Some(open) = replay.imports.iter().find(|x| x.op.id == *op_id) {
                        if after_cp {
                            replay.changes.push(AuthorityChange {
                                root: open.op.root,
                                root_path: open.op.root_path.clone(),
                                auth: open.op.dest,
                                epoch: open.op.epoch,
                                sessions: open.sessions.clone(),
                            });
                        }
                    }
                }
            }
        }

        replay.exports.retain(|x| !export_complete.contains(&x.op.id));
        for open in replay.exports.iter_mut() {
            open.finished = export_finished.contains(&open.op.id);
        }
        replay.imports.retain(|x| !import_finished.contains(&x.op.id));
        Ok(replay)
    }
}

/// Store whose appends can be made to fail, standing in for a full disk.
#[cfg(test)]
pub(crate) struct FailingStore {
    inner: Arc<dyn JournalStore>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStore {
    pub(crate) fn wrap(inner: Arc<dyn JournalStore>) -> Self {
        Self {
            inner,
            failing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl JournalStore for FailingStore {
    fn append(&self, entry: &JournalEntry) -> Result<(), MetaError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MetaError::JournalError("disk full".into()));
        }
        self.inner.append(entry)
    }

    fn read_all(&self) -> Result<Vec<JournalEntry>, MetaError> {
        self.inner.read_all()
    }

    fn truncate_before(&self, sequence: u64) -> Result<usize, MetaError> {
        self.inner.truncate_before(sequence)
    }
}
