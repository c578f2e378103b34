//! Runtime configuration, env-derived with typed defaults.

use std::env;
use std::str::FromStr;

/// Default total weigher weight permitted per compaction queue.
pub const DEFAULT_QUEUE_MAX_WEIGHT: u64 = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct RecoveryConfig {
    /// Total permitted weigher weight per compaction queue
    /// (`recovery.queue.max_weight`).
    pub queue_max_weight: u64,
    /// Require OPEN as the first entry of every recovery log
    /// (`recovery.validate_first_key`). Disabled only for diagnostic replay
    /// of partial logs.
    pub validate_first_key: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            queue_max_weight: DEFAULT_QUEUE_MAX_WEIGHT,
            validate_first_key: true,
        }
    }
}

impl RecoveryConfig {
    pub fn from_env() -> Self {
        Self {
            queue_max_weight: read_env_u64(
                "STRATA_RECOVERY_QUEUE_MAX_WEIGHT",
                DEFAULT_QUEUE_MAX_WEIGHT,
            ),
            validate_first_key: read_env_bool("STRATA_RECOVERY_VALIDATE_FIRST_KEY", true),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.queue_max_weight > 0,
            "recovery.queue.max_weight must be positive"
        );
        Ok(())
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}
