//! Templates: named, immutable blueprints rooms are created from.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default resource limits applied to every room created from a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// CPU limit, in (fractional) cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    /// Size of `/dev/shm` in MiB. Browsers and media pipelines need more
    /// than the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_mb: Option<u64>,
}

impl ResourceLimits {
    /// Returns `self` with every field `overrides` sets replaced.
    pub fn merged(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_mb: overrides.memory_mb.or(self.memory_mb),
            cpus: overrides.cpus.or(self.cpus),
            shm_mb: overrides.shm_mb.or(self.shm_mb),
        }
    }
}

/// One recognized environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// A required variable without a default must be supplied as an override.
    #[serde(default)]
    pub required: bool,
}

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// A port the container listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    pub container_port: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
}

/// A named, immutable blueprint for creating rooms.
///
/// The first entry of `ports` is the one the gateway proxies to; a
/// template therefore needs at least one TCP port first in the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,
    pub ports: Vec<ExposedPort>,
}

impl Template {
    /// Number of host ports a room created from this template holds.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Looks up a recognized environment variable.
    pub fn env_var(&self, name: &str) -> Option<&EnvVarSpec> {
        self.env.iter().find(|v| v.name == name)
    }
}
