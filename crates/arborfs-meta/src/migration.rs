//! Migration operations and their numbered phases.
//!
//! Each side of a migration walks thirteen phases. The numbers are stable:
//! they are what kill points are armed with and what status reports show.

use serde::{Deserialize, Serialize};

use crate::namespace::DirPath;
use crate::types::{DirId, MigrationSide, OperationId, RankId, Timestamp};

/// Exporter-side phases, numbered 1 through 13.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExportPhase {
    /// Authority and destination checked, discover sent
    Discover = 1,
    /// Discover acknowledged
    Discovered = 2,
    /// Subtree root frozen
    Freezing = 3,
    /// Metadata serialized and sent
    Prepping = 4,
    /// Prep acknowledged
    Prepped = 5,
    /// Bystanders warned
    Warning = 6,
    /// Bystander acks collected
    WarningAcked = 7,
    /// Durable start record written; point of no return
    LoggingStart = 8,
    /// Payload and sessions sent
    Transfer = 9,
    /// Importer acknowledged the payload
    TransferAcked = 10,
    /// Durable finish record written; authority transferred
    LoggingFinish = 11,
    /// Bystanders and importer notified
    Notify = 12,
    /// Importer confirmed; state dropped
    Finish = 13,
}

/// Importer-side phases, numbered 1 through 13.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ImportPhase {
    /// Discover received
    Discovering = 1,
    /// Discover acknowledged
    Discovered = 2,
    /// Prep received, validating
    Prepping = 3,
    /// Pending boundary created, prep acknowledged
    Prepped = 4,
    /// Payload received
    Receiving = 5,
    /// Durable start record written; point of no return
    LoggingStart = 6,
    /// Migrated sessions staged
    Acking = 7,
    /// Payload acknowledged
    Acked = 8,
    /// Finish received
    Finishing = 9,
    /// Durable finish record written; boundary authoritative
    LoggingFinish = 10,
    /// Sessions installed and queued requests released
    Sessions = 11,
    /// Finish acknowledged
    Confirmed = 12,
    /// State dropped
    Finish = 13,
}

impl ExportPhase {
    /// Phase number, 1 through 13.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// True once the start record is durable.
    pub fn is_durable(self) -> bool {
        self >= ExportPhase::LoggingStart
    }
}

impl ImportPhase {
    /// Phase number, 1 through 13.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// True once the start record is durable.
    pub fn is_durable(self) -> bool {
        self >= ImportPhase::LoggingStart
    }
}

/// Highest phase number on either side.
pub const PHASE_COUNT: u8 = 13;

/// One attempt to move a subtree from `source` to `dest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOperation {
    /// Attempt identifier
    pub id: OperationId,
    /// Rank giving up authority
    pub source: RankId,
    /// Rank receiving authority
    pub dest: RankId,
    /// Subtree root
    pub root: DirId,
    /// Path of the root when the attempt started
    pub root_path: DirPath,
    /// Epoch the boundary carries once the migration completes
    pub epoch: u64,
    /// When the attempt started
    pub started_at: Timestamp,
}

impl MigrationOperation {
    /// Starts a new attempt with a fresh id.
    pub fn new(source: RankId, dest: RankId, root: DirId, root_path: DirPath, epoch: u64) -> Self {
        Self {
            id: OperationId::generate(),
            source,
            dest,
            root,
            root_path,
            epoch,
            started_at: Timestamp::now(),
        }
    }

    /// The other participant as seen from `side`.
    pub fn peer(&self, side: MigrationSide) -> RankId {
        match side {
            MigrationSide::Export => self.dest,
            MigrationSide::Import => self.source,
        }
    }
}

/// Snapshot of an in-flight operation for status output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Attempt identifier
    pub id: OperationId,
    /// Which side this rank runs
    pub side: MigrationSide,
    /// Current phase number
    pub phase: u8,
    /// Subtree root path
    pub root_path: DirPath,
    /// The other participant
    pub peer: RankId,
    /// Past this side's point of no return
    pub durable: bool,
}
