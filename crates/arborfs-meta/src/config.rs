use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::pin::PinKind;
use crate::rank::RankConfig;
use crate::session::DEFAULT_MAX_HOPS;
use crate::types::MetaError;

/// Kill points armed on one rank's first incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillPoints {
    /// Rank to arm
    pub rank: u32,
    /// Exporter phase to die at
    #[serde(default)]
    pub export_at: Option<u8>,
    /// Importer phase to die at
    #[serde(default)]
    pub import_at: Option<u8>,
}

/// A pin applied at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinDirective {
    /// Directory, created if missing
    pub path: String,
    /// Attribute to set
    #[serde(default = "default_pin_kind")]
    pub kind: PinKind,
    /// Attribute value as an administrator would write it
    pub value: String,
}

fn default_pin_kind() -> PinKind {
    PinKind::Export
}

/// Settings for a metadata cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Ranks that should be active
    pub max_active_ranks: u32,
    /// Idle daemons available for takeover and growth
    pub standby_count: u32,
    /// Hard limit on rank numbers; pins at or above it are refused
    pub max_ranks: u32,
    /// Ticks a failed rank waits before a standby takes over
    pub beacon_grace_ticks: u64,
    /// Ticks an export may spend before its point of no return
    pub export_timeout_ticks: u64,
    /// Ticks before a failed export of the same subtree to the same rank is retried
    pub retry_backoff_ticks: u64,
    /// Forwarding budget for session requests
    pub max_session_hops: u8,
    /// Deliveries allowed per settle before giving up
    pub settle_max_steps: usize,
    /// Where journals live; None keeps them in memory
    pub journal_dir: Option<PathBuf>,
    /// Kill points to arm at startup
    pub kill_points: Vec<KillPoints>,
    /// Hold queued session requests on importers until cleared
    pub inject_session_race: bool,
    /// Emit JSON logs from the binary
    pub log_json: bool,
    /// Pins applied by the binary at startup
    pub pins: Vec<PinDirective>,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            max_active_ranks: 1,
            standby_count: 1,
            max_ranks: 256,
            beacon_grace_ticks: 2,
            export_timeout_ticks: 30,
            retry_backoff_ticks: 4,
            max_session_hops: DEFAULT_MAX_HOPS,
            settle_max_steps: 200_000,
            journal_dir: None,
            kill_points: Vec::new(),
            inject_session_race: false,
            log_json: false,
            pins: Vec::new(),
        }
    }
}

impl MetaConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, MetaError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MetaConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| MetaError::ConfigError(e.to_string()))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| MetaError::ConfigError(e.to_string()))?,
            _ => {
                return Err(MetaError::ConfigError(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), MetaError> {
        if self.max_ranks == 0 {
            return Err(MetaError::ConfigError("max_ranks must be positive".into()));
        }
        if self.max_active_ranks == 0 || self.max_active_ranks > self.max_ranks {
            return Err(MetaError::ConfigError(format!(
                "max_active_ranks {} must be within 1..={}",
                self.max_active_ranks, self.max_ranks
            )));
        }
        if self.export_timeout_ticks == 0 {
            return Err(MetaError::ConfigError(
                "export_timeout_ticks must be positive".into(),
            ));
        }
        for kp in &self.kill_points {
            if kp.rank >= self.max_ranks {
                return Err(MetaError::NoSuchRank(kp.rank as i64));
            }
        }
        Ok(())
    }

    /// Per-rank settings derived from this config.
    pub fn rank_config(&self) -> RankConfig {
        RankConfig {
            export_timeout_ticks: self.export_timeout_ticks,
            retry_backoff_ticks: self.retry_backoff_ticks,
            max_session_hops: self.max_session_hops,
            inject_session_race: self.inject_session_race,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MetaConfig::default();
        assert_eq!(config.max_active_ranks, 1);
        assert_eq!(config.max_ranks, 256);
        assert_eq!(config.max_session_hops, 8);
        assert!(config.journal_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
max_active_ranks = 2
beacon_grace_ticks = 5

[[pins]]
path = "/1"
value = "1"

[[pins]]
path = "/home"
kind = "distributed"
value = "1"

[[kill_points]]
rank = 0
export_at = 8
"#
        )
        .unwrap();

        let config = MetaConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_active_ranks, 2);
        assert_eq!(config.beacon_grace_ticks, 5);
        assert_eq!(config.standby_count, 1);
        assert_eq!(config.pins.len(), 2);
        assert_eq!(config.pins[0].kind, PinKind::Export);
        assert_eq!(config.pins[1].kind, PinKind::Distributed);
        assert_eq!(config.kill_points[0].export_at, Some(8));
        assert_eq!(config.kill_points[0].import_at, None);
    }

    #[test]
    fn test_from_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"max_active_ranks": 3, "inject_session_race": true, "log_json": true}}"#
        )
        .unwrap();

        let config = MetaConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_active_ranks, 3);
        assert!(config.inject_session_race);
        assert!(config.rank_config().inject_session_race);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            MetaConfig::from_file(file.path()),
            Err(MetaError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let config = MetaConfig {
            max_active_ranks: 300,
            ..MetaConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MetaConfig {
            kill_points: vec![KillPoints {
                rank: 999,
                export_at: Some(1),
                import_at: None,
            }],
            ..MetaConfig::default()
        };
        assert!(matches!(config.validate(), Err(MetaError::NoSuchRank(999))));
    }
}
