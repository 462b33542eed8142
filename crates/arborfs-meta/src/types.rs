use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies a directory in the shared namespace. Stable across renames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirId(u64);

impl DirId {
    /// The root directory ID (always 1)
    pub const ROOT: DirId = DirId(1);

    /// Creates a new DirId from a raw u64 value
    pub fn new(id: u64) -> Self {
        DirId(id)
    }

    /// Returns the raw u64 value of this directory ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Represents an authority rank: one slot in the set of cooperating metadata servers
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RankId(u32);

impl RankId {
    /// Rank 0 always holds authority for the namespace root.
    pub const ZERO: RankId = RankId(0);

    /// Creates a new RankId from a raw u32 value
    pub fn new(rank: u32) -> Self {
        RankId(rank)
    }

    /// Returns the raw u32 value of this rank
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global identifier of a daemon process. A rank served by a new gid means a takeover happened.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DaemonGid(u64);

impl DaemonGid {
    /// Creates a new DaemonGid from a raw u64 value
    pub fn new(gid: u64) -> Self {
        DaemonGid(gid)
    }

    /// Returns the raw u64 value of this gid
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DaemonGid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gid:{}", self.0)
    }
}

/// Identifies one migration attempt. Retries get a fresh id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generates a new random operation ID
    pub fn generate() -> Self {
        OperationId(Uuid::new_v4())
    }

    /// Wraps an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        OperationId(id)
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a client of the namespace
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    /// Creates a new ClientId from a raw u64 value
    pub fn new(id: u64) -> Self {
        ClientId(id)
    }

    /// Returns the raw u64 value of this client ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client.{}", self.0)
    }
}

/// Which half of a migration a rank is running
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationSide {
    /// Outbound side, on the rank giving up authority
    Export,
    /// Inbound side, on the rank receiving authority
    Import,
}

impl fmt::Display for MigrationSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationSide::Export => write!(f, "export"),
            MigrationSide::Import => write!(f, "import"),
        }
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Error types for the subtree authority service
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// A pin value could not be parsed or is out of range for its kind.
    #[error("invalid pin value '{value}' for {kind}: {reason}")]
    InvalidPin {
        /// Attribute the value was written to
        kind: String,
        /// The rejected value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A pin references a rank beyond the configured hard limit.
    #[error("rank {0} exceeds the configured rank limit")]
    NoSuchRank(i64),

    /// The requested path does not exist.
    #[error("path '{0}' not found")]
    NotFound(String),

    /// The target path already exists.
    #[error("path '{0}' already exists")]
    AlreadyExists(String),

    /// The path is malformed or the operation is not valid for it.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// Structural mutation refused because a subtree on the path is frozen for migration.
    #[error("subtree '{0}' is frozen for migration")]
    Frozen(String),

    /// This rank is not the authority for the subtree.
    #[error("rank {rank} is not authoritative for '{path}'")]
    NotAuthority {
        /// The rank that was asked
        rank: RankId,
        /// The subtree path
        path: String,
    },

    /// Migration destination is not up.
    #[error("destination rank {0} is unavailable")]
    DestinationUnavailable(RankId),

    /// Destination refused the import.
    #[error("import of '{root}' rejected: {reason}")]
    ImportRejected {
        /// Subtree root path
        root: String,
        /// Reason given by the importer
        reason: String,
    },

    /// Another migration overlaps the requested subtree.
    #[error("migration already in progress over '{0}'")]
    MigrationInProgress(String),

    /// The named rank is not running.
    #[error("rank {0} is not running")]
    RankUnavailable(RankId),

    /// An armed kill point fired; the rank process must stop immediately.
    #[error("kill point hit: {side} phase {phase}")]
    KillPoint {
        /// Side whose phase triggered
        side: MigrationSide,
        /// Phase number (1-13)
        phase: u8,
    },

    /// A session request ran out of forwarding hops before reaching its authority.
    #[error("session for {client} on '{path}' dropped after {hops} hops")]
    SessionDropped {
        /// Requesting client
        client: ClientId,
        /// Path the client asked for
        path: String,
        /// Forwards taken before the drop
        hops: u8,
    },

    /// Two ranks claim authority for the same subtree root.
    #[error("split authority on '{path}': ranks {first} and {second}")]
    SplitAuthority {
        /// Subtree root path
        path: String,
        /// First claimant
        first: RankId,
        /// Second claimant
        second: RankId,
    },

    /// The cluster did not reach a quiescent state in the allotted rounds.
    #[error("cluster did not converge: {0}")]
    NotConverged(String),

    /// Journal read or write failed.
    #[error("journal error: {0}")]
    JournalError(String),

    /// Encoding or decoding a record or message failed.
    #[error("codec error: {0}")]
    CodecError(String),

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    ConfigError(String),

    /// A shared structure's lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl MetaError {
    /// True for errors that represent an abrupt process stop rather than a failed request.
    pub fn is_kill_point(&self) -> bool {
        matches!(self, MetaError::KillPoint { .. })
    }

    /// True for errors that leave a rank unable to continue: its process
    /// stops and a standby replays the journal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MetaError::KillPoint { .. } | MetaError::JournalError(_) | MetaError::IoError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_ordering() {
        assert!(RankId::new(0) < RankId::new(1));
        assert_eq!(RankId::ZERO.as_u32(), 0);
    }

    #[test]
    fn test_operation_ids_unique() {
        let a = OperationId::generate();
        let b = OperationId::generate();
        assert_ne!(a, b);
        assert_eq!(OperationId::from_uuid(a.as_uuid()), a);
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp { secs: 5, nanos: 10 };
        let b = Timestamp { secs: 5, nanos: 11 };
        let c = Timestamp { secs: 6, nanos: 0 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_kill_point_detection() {
        let err = MetaError::KillPoint {
            side: MigrationSide::Export,
            phase: 8,
        };
        assert!(err.is_kill_point());
        assert!(!MetaError::NotFound("/x".into()).is_kill_point());
        assert!(err.is_fatal());
        assert!(MetaError::JournalError("disk full".into()).is_fatal());
        assert!(!MetaError::JournalError("disk full".into()).is_kill_point());
        assert!(!MetaError::NotFound("/x".into()).is_fatal());
        assert_eq!(err.to_string(), "kill point hit: export phase 8");
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(RankId::new(3).to_string(), "3");
        assert_eq!(DaemonGid::new(42).to_string(), "gid:42");
        assert_eq!(ClientId::new(7).to_string(), "client.7");
        assert_eq!(DirId::ROOT.to_string(), "0x1");
    }
}
