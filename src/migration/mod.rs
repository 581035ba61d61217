//! Imperative, multi-step state transitions that cannot be expressed as a desired state.

use std::time::Duration;

pub mod loki_to_vali;
pub mod seed;

pub use loki_to_vali::rename_loki_pvc_to_vali_pvc;
pub use seed::{cleanup_legacy_priority_classes, resize_or_delete_vali_data_volume};

/// Timings of a migration
#[derive(Clone, Debug)]
pub struct MigrationOptions {
    /// Pause after a change other controllers must observe before the next step
    pub settle: Duration,
    /// Deadline of each wait
    pub timeout: Duration,
    /// Interval between polls while waiting
    pub interval: Duration,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(10),
            timeout: Duration::from_secs(2 * 60),
            interval: Duration::from_secs(2),
        }
    }
}
