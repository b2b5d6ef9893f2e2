//! Room manager configuration.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use roomforge_backend::RetryPolicy;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// OrphanPolicy
// ---------------------------------------------------------------------------

/// What reconcile does with a managed instance no room claims.
///
/// - **Flag**: leave it alone, log a warning and list it in the report.
/// - **Adopt**: rebuild a room record from the instance labels and claim
///   its ports. Falls back to `Flag` when the labels are incomplete or
///   the name or ports are already taken.
/// - **Remove**: delete the instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    #[default]
    Flag,
    Adopt,
    Remove,
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flag" => Ok(Self::Flag),
            "adopt" => Ok(Self::Adopt),
            "remove" => Ok(Self::Remove),
            other => Err(format!("unknown orphan policy {other:?}")),
        }
    }
}

impl fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag => write!(f, "flag"),
            Self::Adopt => write!(f, "adopt"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

// ---------------------------------------------------------------------------
// ManagerConfig
// ---------------------------------------------------------------------------

/// Settings for a [`RoomManager`](crate::RoomManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Host ports rooms are allocated from, inclusive on both ends.
    pub port_range: RangeInclusive<u16>,

    /// How long `create_room` and `start_room` wait for the instance to
    /// report running before rolling back.
    pub readiness_timeout: Duration,

    /// Delay between readiness polls.
    pub readiness_poll_interval: Duration,

    /// Retry policy for idempotent backend calls.
    pub retry: RetryPolicy,

    /// Period of the background reconciler.
    pub reconcile_interval: Duration,

    /// Handling of managed instances no room claims.
    pub orphan_policy: OrphanPolicy,

    /// Prefix for engine-side instance names (`{prefix}{room name}`).
    pub instance_prefix: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            port_range: 31000..=31999,
            readiness_timeout: Duration::from_secs(30),
            readiness_poll_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
            reconcile_interval: Duration::from_secs(30),
            orphan_policy: OrphanPolicy::Flag,
            instance_prefix: "roomforge-".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.port_range, 31000..=31999);
        assert_eq!(config.orphan_policy, OrphanPolicy::Flag);
        assert!(config.readiness_poll_interval < config.readiness_timeout);
    }

    #[test]
    fn test_orphan_policy_parse() {
        assert_eq!("flag".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Flag));
        assert_eq!("ADOPT".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Adopt));
        assert_eq!("remove".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Remove));
        assert!("keep".parse::<OrphanPolicy>().is_err());
    }

    #[test]
    fn test_orphan_policy_display_round_trips() {
        for policy in [OrphanPolicy::Flag, OrphanPolicy::Adopt, OrphanPolicy::Remove] {
            assert_eq!(policy.to_string().parse::<OrphanPolicy>(), Ok(policy));
        }
    }
}
