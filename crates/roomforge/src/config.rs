//! Service configuration from `ROOMFORGE_*` environment variables.

use std::fmt::Display;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use roomforge_backend::DockerConfig;
use roomforge_gateway::GatewayConfig;
use roomforge_room::{ManagerConfig, OrphanPolicy};

/// A variable is present but unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: String, reason: String },
}

impl ConfigError {
    fn invalid(var: &str, reason: impl Display) -> Self {
        Self::Invalid {
            var: var.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Everything `roomforged` needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the API and gateway listen on (default `0.0.0.0:8080`).
    pub bind: SocketAddr,
    /// Backend adapter name: `docker` (default) or `mock`.
    pub backend: String,
    /// JSON template file; no templates are loaded when unset.
    pub templates_path: Option<PathBuf>,
    pub manager: ManagerConfig,
    pub gateway: GatewayConfig,
    pub docker: DockerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backend: "docker".to_string(),
            templates_path: None,
            manager: ManagerConfig::default(),
            gateway: GatewayConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Environment Variables
    /// - `ROOMFORGE_BIND` - listen address (default `0.0.0.0:8080`)
    /// - `ROOMFORGE_BACKEND` - `docker` or `mock` (default `docker`)
    /// - `ROOMFORGE_TEMPLATES` - path of the JSON template file
    /// - `ROOMFORGE_PORT_RANGE` - host ports as `first-last` (default `31000-31999`)
    /// - `ROOMFORGE_READINESS_TIMEOUT_MS` - readiness wait (default 30000)
    /// - `ROOMFORGE_RECONCILE_INTERVAL_MS` - reconcile period (default 30000)
    /// - `ROOMFORGE_ORPHAN_POLICY` - `flag`, `adopt` or `remove` (default `flag`)
    /// - `ROOMFORGE_INSTANCE_PREFIX` - engine-side name prefix (default `roomforge-`)
    /// - `ROOMFORGE_GATEWAY_PREFIX` - gateway path segment (default `rooms`)
    /// - `ROOMFORGE_UPSTREAM_CONNECT_TIMEOUT_MS` - gateway dial timeout (default 5000)
    /// - `ROOMFORGE_BODY_LIMIT` - largest proxied request body in bytes
    /// - `ROOMFORGE_DOCKER_BINARY` - engine CLI (default `docker`)
    /// - `ROOMFORGE_DOCKER_ENDPOINT_HOST` - host rooms are reached on (default `127.0.0.1`)
    /// - `ROOMFORGE_DOCKER_NETWORK` - network to attach instances to
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(bind) = parse(&get, "ROOMFORGE_BIND")? {
            config.bind = bind;
        }
        if let Some(backend) = get("ROOMFORGE_BACKEND") {
            config.backend = backend.trim().to_ascii_lowercase();
        }
        config.templates_path = get("ROOMFORGE_TEMPLATES").map(PathBuf::from);

        // ---- Manager ----
        if let Some(raw) = get("ROOMFORGE_PORT_RANGE") {
            config.manager.port_range = parse_port_range(&raw)
                .map_err(|reason| ConfigError::invalid("ROOMFORGE_PORT_RANGE", reason))?;
        }
        if let Some(timeout) = parse_millis(&get, "ROOMFORGE_READINESS_TIMEOUT_MS")? {
            config.manager.readiness_timeout = timeout;
        }
        if let Some(interval) = parse_millis(&get, "ROOMFORGE_RECONCILE_INTERVAL_MS")? {
            config.manager.reconcile_interval = interval;
        }
        if let Some(policy) = parse::<OrphanPolicy>(&get, "ROOMFORGE_ORPHAN_POLICY")? {
            config.manager.orphan_policy = policy;
        }
        if let Some(prefix) = get("ROOMFORGE_INSTANCE_PREFIX") {
            config.manager.instance_prefix = prefix;
        }

        // ---- Gateway ----
        if let Some(prefix) = get("ROOMFORGE_GATEWAY_PREFIX") {
            config.gateway.prefix = prefix;
        }
        if let Some(timeout) = parse_millis(&get, "ROOMFORGE_UPSTREAM_CONNECT_TIMEOUT_MS")? {
            config.gateway.connect_timeout = timeout;
        }
        if let Some(limit) = parse(&get, "ROOMFORGE_BODY_LIMIT")? {
            config.gateway.body_limit = limit;
        }

        // ---- Docker ----
        if let Some(binary) = get("ROOMFORGE_DOCKER_BINARY") {
            config.docker.binary = binary;
        }
        if let Some(host) = get("ROOMFORGE_DOCKER_ENDPOINT_HOST") {
            config.docker.endpoint_host = host;
        }
        config.docker.network = get("ROOMFORGE_DOCKER_NETWORK");

        Ok(config)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    get(var)
        .map(|raw| raw.trim().parse::<T>().map_err(|e| ConfigError::invalid(var, e)))
        .transpose()
}

fn parse_millis(
    get: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<Duration>, ConfigError> {
    match parse::<u64>(get, var)? {
        Some(0) => Err(ConfigError::invalid(var, "must be greater than zero")),
        other => Ok(other.map(Duration::from_millis)),
    }
}

/// Parses `first-last` into an inclusive, non-empty range.
fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>, String> {
    let (first, last) = raw
        .split_once('-')
        .ok_or_else(|| format!("{raw:?} is not of the form first-last"))?;
    let first: u16 = first.trim().parse().map_err(|e| format!("first port: {e}"))?;
    let last: u16 = last.trim().parse().map_err(|e| format!("last port: {e}"))?;
    if first == 0 || first > last {
        return Err(format!("{first}-{last} is not a valid port range"));
    }
    Ok(first..=last)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind, SocketAddr::from(([0, 0, 0, 0], 8080)));
        assert_eq!(config.backend, "docker");
        assert!(config.templates_path.is_none());
        assert_eq!(config.manager.port_range, 31000..=31999);
        assert_eq!(config.manager.orphan_policy, OrphanPolicy::Flag);
        assert_eq!(config.gateway.prefix, "rooms");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("ROOMFORGE_BIND", "127.0.0.1:9000"),
            ("ROOMFORGE_BACKEND", "Mock"),
            ("ROOMFORGE_TEMPLATES", "/etc/roomforge/templates.json"),
            ("ROOMFORGE_PORT_RANGE", "40000-40009"),
            ("ROOMFORGE_READINESS_TIMEOUT_MS", "1500"),
            ("ROOMFORGE_RECONCILE_INTERVAL_MS", "250"),
            ("ROOMFORGE_ORPHAN_POLICY", "adopt"),
            ("ROOMFORGE_GATEWAY_PREFIX", "r"),
            ("ROOMFORGE_UPSTREAM_CONNECT_TIMEOUT_MS", "750"),
            ("ROOMFORGE_DOCKER_NETWORK", "rooms-net"),
        ])
        .unwrap();
        assert_eq!(config.bind, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.backend, "mock");
        assert_eq!(
            config.templates_path,
            Some(PathBuf::from("/etc/roomforge/templates.json"))
        );
        assert_eq!(config.manager.port_range, 40000..=40009);
        assert_eq!(config.manager.readiness_timeout, Duration::from_millis(1500));
        assert_eq!(config.manager.reconcile_interval, Duration::from_millis(250));
        assert_eq!(config.manager.orphan_policy, OrphanPolicy::Adopt);
        assert_eq!(config.gateway.prefix, "r");
        assert_eq!(config.gateway.connect_timeout, Duration::from_millis(750));
        assert_eq!(config.docker.network.as_deref(), Some("rooms-net"));
    }

    #[test]
    fn test_empty_values_are_ignored() {
        let config = load(&[("ROOMFORGE_BIND", "  "), ("ROOMFORGE_DOCKER_NETWORK", "")]).unwrap();
        assert_eq!(config.bind.port(), 8080);
        assert!(config.docker.network.is_none());
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = load(&[("ROOMFORGE_BIND", "not-an-addr")]).unwrap_err();
        assert!(err.to_string().contains("ROOMFORGE_BIND"));

        let err = load(&[("ROOMFORGE_ORPHAN_POLICY", "burn")]).unwrap_err();
        assert!(err.to_string().contains("ROOMFORGE_ORPHAN_POLICY"));

        let err = load(&[("ROOMFORGE_READINESS_TIMEOUT_MS", "0")]).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("5-5").unwrap(), 5..=5);
        assert_eq!(parse_port_range(" 100 - 200 ").unwrap(), 100..=200);
        assert!(parse_port_range("200-100").is_err());
        assert!(parse_port_range("0-10").is_err());
        assert!(parse_port_range("100").is_err());
        assert!(parse_port_range("1-70000").is_err());
    }
}
