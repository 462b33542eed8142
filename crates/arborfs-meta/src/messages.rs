//! Rank-to-rank protocol messages and their wire encoding.

use serde::{Deserialize, Serialize};

use crate::migration::MigrationOperation;
use crate::namespace::DirPath;
use crate::session::{SessionRecord, SessionRequest};
use crate::subtree::BoundaryClaim;
use crate::types::{DirId, MetaError, OperationId, RankId};

/// Serialized metadata of the region being migrated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreePayload {
    /// Subtree root
    pub root: DirId,
    /// Root path when serialized
    pub root_path: DirPath,
    /// Directories in the region, root first
    pub dirs: Vec<DirId>,
    /// Roots of nested subtrees that stay where they are
    pub bounds: Vec<DirId>,
}

/// Change to a boundary announced to peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryUpdate {
    /// Subtree root
    pub root: DirId,
    /// Current root path
    pub root_path: DirPath,
    /// New authority
    pub auth: RankId,
    /// Epoch of the change
    pub epoch: u64,
    /// True when the boundary was merged away
    pub removed: bool,
}

/// Everything ranks say to each other.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RankMessage {
    /// Exporter asks whether the destination will take the subtree.
    ExportDiscover {
        /// The attempt
        op: MigrationOperation,
    },
    /// Destination's answer to discover.
    ExportDiscoverAck {
        /// The attempt
        op_id: OperationId,
        /// Whether the import is accepted
        accepted: bool,
        /// Refusal reason
        reason: Option<String>,
    },
    /// Exporter sends the frozen region's metadata for validation.
    ExportPrep {
        /// The attempt
        op: MigrationOperation,
        /// Region metadata
        payload: SubtreePayload,
    },
    /// Destination's answer to prep.
    ExportPrepAck {
        /// The attempt
        op_id: OperationId,
        /// Whether validation passed
        accepted: bool,
        /// Refusal reason
        reason: Option<String>,
    },
    /// Bystanders learn that a subtree is about to move.
    ExportWarning {
        /// The attempt
        op: MigrationOperation,
    },
    /// Bystander acknowledgement of a warning.
    ExportWarningAck {
        /// The attempt
        op_id: OperationId,
    },
    /// The subtree itself, sent after the exporter's point of no return.
    ExportDir {
        /// The attempt
        op: MigrationOperation,
        /// Region metadata
        payload: SubtreePayload,
        /// Sessions moving with the subtree
        sessions: Vec<SessionRecord>,
    },
    /// Importer has durably logged the subtree.
    ExportDirAck {
        /// The attempt
        op_id: OperationId,
    },
    /// Exporter has durably given up authority.
    ExportFinish {
        /// The attempt
        op: MigrationOperation,
    },
    /// Importer is authoritative.
    ExportFinishAck {
        /// The attempt
        op_id: OperationId,
    },
    /// Exporter abandoned the attempt before its point of no return.
    ExportCancel {
        /// The attempt
        op_id: OperationId,
        /// Subtree root
        root: DirId,
    },
    /// A boundary changed hands, was split off or merged away.
    SubtreeUpdate(BoundaryUpdate),
    /// A recovering rank's owned boundaries; peers answer with theirs.
    ResolveRequest {
        /// Sender's claims
        claims: Vec<BoundaryClaim>,
    },
    /// Owned boundaries, in answer to a resolve request or pushed to a new rank.
    ResolveReply {
        /// Sender's claims
        claims: Vec<BoundaryClaim>,
    },
    /// A client session request, possibly forwarded.
    Session(SessionRequest),
}

impl RankMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RankMessage::ExportDiscover { .. } => "export_discover",
            RankMessage::ExportDiscoverAck { .. } => "export_discover_ack",
            RankMessage::ExportPrep { .. } => "export_prep",
            RankMessage::ExportPrepAck { .. } => "export_prep_ack",
            RankMessage::ExportWarning { .. } => "export_warning",
            RankMessage::ExportWarningAck { .. } => "export_warning_ack",
            RankMessage::ExportDir { .. } => "export_dir",
            RankMessage::ExportDirAck { .. } => "export_dir_ack",
            RankMessage::ExportFinish { .. } => "export_finish",
            RankMessage::ExportFinishAck { .. } => "export_finish_ack",
            RankMessage::ExportCancel { .. } => "export_cancel",
            RankMessage::SubtreeUpdate(_) => "subtree_update",
            RankMessage::ResolveRequest { .. } => "resolve_request",
            RankMessage::ResolveReply { .. } => "resolve_reply",
            RankMessage::Session(_) => "session",
        }
    }
}

/// Encodes a message for the wire.
pub fn encode(msg: &RankMessage) -> Result<Vec<u8>, MetaError> {
    bincode::serialize(msg).map_err(|e| MetaError::CodecError(e.to_string()))
}

/// Decodes a message from the wire.
pub fn decode(bytes: &[u8]) -> Result<RankMessage, MetaError> {
    bincode::deserialize(bytes).map_err(|e| MetaError::CodecError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientId, Timestamp};

    #[test]
    fn test_export_dir_survives_wire() {
        let op = MigrationOperation::new(
            RankId::new(0),
            RankId::new(1),
            DirId::new(7),
            DirPath::parse("/abc").unwrap(),
            2,
        );
        let msg = RankMessage::ExportDir {
            op: op.clone(),
            payload: SubtreePayload {
                root: DirId::new(7),
                root_path: DirPath::parse("/abc").unwrap(),
                dirs: vec![DirId::new(7), DirId::new(8)],
                bounds: vec![],
            },
            sessions: vec![SessionRecord {
                client: ClientId::new(4),
                dir: DirId::new(8),
                path: DirPath::parse("/abc/x").unwrap(),
                established_at: Timestamp { secs: 1, nanos: 2 },
            }],
        };
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "export_dir");
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, MetaError::CodecError(_)));
    }
}
