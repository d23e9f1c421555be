//! Engine configuration
//!
//! Tunables shared by the merge engine, ledger and lock maintenance. The
//! struct is constructed by the caller and passed into each component.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Locks older than this are reported as stale
    pub stale_lock_after_secs: u64,
    /// Fresh uuids drawn before display id allocation gives up
    pub display_id_attempts: u32,
    /// History rows returned when the caller gives no limit
    pub default_history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_lock_after_secs: 900,
            display_id_attempts: 8,
            default_history_limit: 100,
        }
    }
}

impl EngineConfig {
    /// Stale lock threshold, rejected when chrono cannot represent it
    pub fn stale_lock_after(&self) -> GraphResult<Duration> {
        i64::try_from(self.stale_lock_after_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                GraphError::validation(format!(
                    "stale_lock_after_secs {} is out of range",
                    self.stale_lock_after_secs
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"stale_lock_after_secs": 60})).unwrap();
        assert_eq!(config.stale_lock_after_secs, 60);
        assert_eq!(config.display_id_attempts, 8);
        assert_eq!(config.stale_lock_after(), Ok(Duration::seconds(60)));
    }

    #[test]
    fn test_out_of_range_stale_threshold_is_rejected() {
        for secs in [100_000_000_000_000_000, u64::MAX] {
            let config = EngineConfig {
                stale_lock_after_secs: secs,
                ..EngineConfig::default()
            };
            let err = config.stale_lock_after().unwrap_err();
            assert_eq!(err.kind(), "validation");
        }
    }
}
