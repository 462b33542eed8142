#![warn(missing_docs)]

//! ArborFS metadata subsystem: subtree authority, pin placement, export/import migration and journal recovery

pub mod balancer;
pub mod cluster;
pub mod config;
pub mod export;
pub mod failpoint;
pub mod import;
pub mod journal;
pub mod messages;
pub mod migration;
pub mod namespace;
pub mod pin;
pub mod rank;
pub mod recovery;
pub mod rename;
pub mod session;
pub mod subtree;
pub mod topology;
pub mod transport;
pub mod types;

pub use cluster::{ClusterStatus, CrashRecord, LocalCluster};
pub use config::MetaConfig;
pub use namespace::{DirPath, Namespace};
pub use pin::{PinKind, PinMode};
pub use rank::{Rank, RankConfig, RankStatus};
pub use types::{ClientId, DaemonGid, DirId, MetaError, MigrationSide, OperationId, RankId};
