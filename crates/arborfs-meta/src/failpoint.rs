//! Kill-point injection for migration phases.
//!
//! A rank consults its injector each time a migration enters a phase, after
//! any durable record for that phase is written and before the phase's
//! messages leave. An armed injector answers with [`MetaError::KillPoint`],
//! which the cluster driver treats as an abrupt process stop.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::migration::PHASE_COUNT;
use crate::types::{MetaError, MigrationSide};

/// Decides whether the process dies at a phase.
pub trait FailureInjector: Send + Sync {
    /// Returns `Err(MetaError::KillPoint)` to stop the process here.
    fn check(&self, side: MigrationSide, phase: u8) -> Result<(), MetaError>;
}

/// Never fires. Production default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInjector;

impl FailureInjector for NoopInjector {
    fn check(&self, _side: MigrationSide, _phase: u8) -> Result<(), MetaError> {
        Ok(())
    }
}

/// Fires once, at the first phase matching an armed point.
#[derive(Debug, Default)]
pub struct KillPointInjector {
    export_at: Option<u8>,
    import_at: Option<u8>,
    fired: AtomicBool,
}

impl KillPointInjector {
    /// Arms kill points for either side. Phases outside 1..=13 are refused.
    pub fn new(export_at: Option<u8>, import_at: Option<u8>) -> Result<Self, MetaError> {
        for phase in export_at.iter().chain(import_at.iter()) {
            if *phase == 0 || *phase > PHASE_COUNT {
                return Err(MetaError::ConfigError(format!(
                    "kill point phase {} outside 1..={}",
                    phase, PHASE_COUNT
                )));
            }
        }
        Ok(Self {
            export_at,
            import_at,
            fired: AtomicBool::new(false),
        })
    }

    /// Arms a single side.
    pub fn at(side: MigrationSide, phase: u8) -> Result<Self, MetaError> {
        match side {
            MigrationSide::Export => Self::new(Some(phase), None),
            MigrationSide::Import => Self::new(None, Some(phase)),
        }
    }

    /// True once the injector has fired.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl FailureInjector for KillPointInjector {
    fn check(&self, side: MigrationSide, phase: u8) -> Result<(), MetaError> {
        let armed = match side {
            MigrationSide::Export => self.export_at,
            MigrationSide::Import => self.import_at,
        };
        if armed != Some(phase) {
            return Ok(());
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::warn!(%side, phase, "kill point fired");
        Err(MetaError::KillPoint { side, phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_never_fires() {
        let injector = NoopInjector;
        for phase in 1..=PHASE_COUNT {
            assert!(injector.check(MigrationSide::Export, phase).is_ok());
            assert!(injector.check(MigrationSide::Import, phase).is_ok());
        }
    }

    #[test]
    fn test_fires_once_on_matching_side() {
        let injector = KillPointInjector::at(MigrationSide::Import, 6).unwrap();
        assert!(injector.check(MigrationSide::Export, 6).is_ok());
        assert!(injector.check(MigrationSide::Import, 5).is_ok());
        let err = injector.check(MigrationSide::Import, 6).unwrap_err();
        assert!(err.is_kill_point());
        assert!(injector.has_fired());
        assert!(injector.check(MigrationSide::Import, 6).is_ok());
    }

    #[test]
    fn test_both_sides_share_one_shot() {
        let injector = KillPointInjector::new(Some(3), Some(4)).unwrap();
        assert!(injector.check(MigrationSide::Export, 3).is_err());
        assert!(injector.check(MigrationSide::Import, 4).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(KillPointInjector::new(Some(0), None).is_err());
        assert!(KillPointInjector::new(None, Some(14)).is_err());
    }
}
