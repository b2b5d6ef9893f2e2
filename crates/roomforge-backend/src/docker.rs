//! Docker backend: drives the `docker` CLI.
//!
//! Every operation shells out to the configured binary with
//! `tokio::process::Command`, bounded by `command_timeout`. A timed-out
//! child is killed on drop. Failures are classified from stderr into
//! the [`BackendError`] taxonomy.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use roomforge_protocol::{BackendRef, Endpoint};
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::{Backend, BackendError, InstanceSpec, InstanceStatus, InstanceSummary, labels};

/// Settings for [`DockerBackend`].
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Binary to invoke (`docker`, or a compatible CLI such as `podman`).
    pub binary: String,
    /// Host address reported in endpoints; the gateway connects here.
    pub endpoint_host: String,
    /// Host address published ports bind to.
    pub bind_host: String,
    /// Network to attach instances to, if any.
    pub network: Option<String>,
    /// Upper bound on a single CLI invocation.
    pub command_timeout: Duration,
    /// Grace period handed to `docker stop -t`.
    pub stop_timeout_secs: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            endpoint_host: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
            network: None,
            command_timeout: Duration::from_secs(30),
            stop_timeout_secs: 10,
        }
    }
}

/// [`Backend`] backed by a local Docker engine.
pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Runs one CLI invocation and returns trimmed stdout.
    async fn docker(&self, args: Vec<String>) -> Result<String, BackendError> {
        let op = args.first().cloned().unwrap_or_default();
        tracing::debug!(binary = %self.config.binary, ?args, "running docker command");

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.config.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(BackendError::Unavailable(format!(
                    "failed to run {}: {e}",
                    self.config.binary
                )));
            }
            Err(_) => {
                return Err(BackendError::Timeout(format!(
                    "docker {op} exceeded {:?}",
                    self.config.command_timeout
                )));
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_stderr(stderr.trim()))
        }
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<BackendRef, BackendError> {
        let id = self.docker(create_args(spec, &self.config)).await?;
        if id.is_empty() {
            return Err(BackendError::Failed("docker create printed no id".into()));
        }
        Ok(BackendRef::new(id))
    }

    async fn start(&self, backend_ref: &BackendRef) -> Result<(), BackendError> {
        self.docker(vec!["start".into(), backend_ref.to_string()])
            .await
            .map(|_| ())
    }

    async fn stop(&self, backend_ref: &BackendRef) -> Result<(), BackendError> {
        // `docker stop` on an exited container already succeeds.
        self.docker(vec![
            "stop".into(),
            "-t".into(),
            self.config.stop_timeout_secs.to_string(),
            backend_ref.to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn remove(&self, backend_ref: &BackendRef) -> Result<(), BackendError> {
        match self
            .docker(vec![
                "rm".into(),
                "-f".into(),
                "-v".into(),
                backend_ref.to_string(),
            ])
            .await
        {
            Ok(_) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, backend_ref: &BackendRef) -> Result<InstanceStatus, BackendError> {
        let out = self
            .docker(vec![
                "inspect".into(),
                "--type".into(),
                "container".into(),
                backend_ref.to_string(),
            ])
            .await?;
        let doc: Value = serde_json::from_str(&out)
            .map_err(|e| BackendError::Failed(format!("unparseable inspect output: {e}")))?;
        let first = doc
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| BackendError::NotFound(backend_ref.to_string()))?;
        Ok(parse_status(first, &self.config.endpoint_host))
    }

    async fn list(&self) -> Result<Vec<InstanceSummary>, BackendError> {
        // One `ps` call: a container removed mid-listing simply drops out
        // instead of failing a follow-up `inspect`.
        let out = self
            .docker(vec![
                "ps".into(),
                "-a".into(),
                "--no-trunc".into(),
                "--filter".into(),
                format!("label={}=true", labels::MANAGED),
                "--format".into(),
                list_format(),
            ])
            .await?;
        parse_ps_lines(&out)
    }
}

/// Builds the argument list for `docker create`.
fn create_args(spec: &InstanceSpec, config: &DockerConfig) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".into(), spec.name.clone()];

    for (k, v) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{k}={v}"));
    }
    for (k, v) in &spec.env {
        args.push("-e".into());
        args.push(format!("{k}={v}"));
    }
    for binding in &spec.ports {
        args.push("-p".into());
        args.push(format!(
            "{}:{}:{}/{}",
            config.bind_host, binding.host_port, binding.container_port, binding.protocol
        ));
    }
    if let Some(mb) = spec.resources.memory_mb {
        args.push("--memory".into());
        args.push(format!("{mb}m"));
    }
    if let Some(cpus) = spec.resources.cpus {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }
    if let Some(mb) = spec.resources.shm_mb {
        args.push("--shm-size".into());
        args.push(format!("{mb}m"));
    }
    if let Some(network) = &config.network {
        args.push("--network".into());
        args.push(network.clone());
    }
    args.push(spec.image.clone());
    args
}

/// Maps docker CLI stderr onto the error taxonomy.
fn classify_stderr(stderr: &str) -> BackendError {
    let msg = stderr.to_string();
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        BackendError::Unavailable(msg)
    } else if lower.contains("port is already allocated")
        || lower.contains("address already in use")
        || lower.contains("no space left on device")
    {
        BackendError::ResourceExhausted(msg)
    } else if lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such image")
        || lower.contains("manifest unknown")
    {
        BackendError::NotFound(msg)
    } else if lower.contains("is already in use") || lower.contains("conflict") {
        BackendError::Conflict(msg)
    } else if lower.contains("timeout") || lower.contains("deadline exceeded") {
        BackendError::Timeout(msg)
    } else {
        BackendError::Failed(msg)
    }
}

fn parse_labels(container: &Value) -> BTreeMap<String, String> {
    container
        .pointer("/Config/Labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// First published host port: our own label first, then the engine's
/// port bindings.
fn first_host_port(container: &Value) -> Option<u16> {
    let from_label = parse_labels(container)
        .get(labels::PORTS)
        .and_then(|ports| ports.split(',').next().and_then(|p| p.trim().parse().ok()));
    from_label.or_else(|| {
        container
            .pointer("/HostConfig/PortBindings")
            .and_then(Value::as_object)?
            .values()
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(|b| b.get("HostPort")?.as_str()?.parse().ok())
            .next()
    })
}

fn parse_status(container: &Value, endpoint_host: &str) -> InstanceStatus {
    let running = container
        .pointer("/State/Running")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let endpoint = if running {
        first_host_port(container).map(|port| Endpoint::new(endpoint_host, port))
    } else {
        None
    };
    InstanceStatus { running, endpoint }
}

/// `docker ps` template printing one JSON object per container with
/// just the labels in [`labels::ALL`]. `.Labels` itself is a flat
/// comma-joined string, which the ports label would corrupt.
fn list_format() -> String {
    let mut format = String::from(r#"{"id":{{json .ID}},"state":{{json .State}},"labels":{"#);
    for (i, key) in labels::ALL.iter().enumerate() {
        if i > 0 {
            format.push(',');
        }
        format.push_str(&format!(r#""{key}":{{{{json (.Label "{key}")}}}}"#));
    }
    format.push_str("}}");
    format
}

#[derive(Debug, Deserialize)]
struct PsLine {
    id: String,
    state: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

fn parse_ps_lines(out: &str) -> Result<Vec<InstanceSummary>, BackendError> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let ps: PsLine = serde_json::from_str(line)
                .map_err(|e| BackendError::Failed(format!("unparseable ps output: {e}")))?;
            Ok(InstanceSummary {
                backend_ref: BackendRef::new(ps.id),
                running: ps.state == "running",
                // Absent labels render as "".
                labels: ps.labels.into_iter().filter(|(_, v)| !v.is_empty()).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use roomforge_protocol::{PortProtocol, ResourceLimits};
    use serde_json::json;

    use super::*;
    use crate::PortBinding;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: "roomforge-alice".into(),
            image: "example/browser:1".into(),
            env: BTreeMap::from([("PASSWORD".to_string(), "pw".to_string())]),
            resources: ResourceLimits {
                memory_mb: Some(512),
                cpus: Some(1.5),
                shm_mb: Some(256),
            },
            ports: vec![
                PortBinding {
                    host_port: 31000,
                    container_port: 8080,
                    protocol: PortProtocol::Tcp,
                },
                PortBinding {
                    host_port: 31001,
                    container_port: 5000,
                    protocol: PortProtocol::Udp,
                },
            ],
            labels: BTreeMap::from([(labels::MANAGED.to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn test_create_args() {
        let config = DockerConfig {
            network: Some("rooms".into()),
            ..DockerConfig::default()
        };
        let args = create_args(&spec(), &config);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name roomforge-alice"));
        assert!(joined.contains("--label roomforge.managed=true"));
        assert!(joined.contains("-e PASSWORD=pw"));
        assert!(joined.contains("-p 0.0.0.0:31000:8080/tcp"));
        assert!(joined.contains("-p 0.0.0.0:31001:5000/udp"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.contains("--shm-size 256m"));
        assert!(joined.contains("--network rooms"));
        assert_eq!(args.last().map(String::as_str), Some("example/browser:1"));
    }

    #[test]
    fn test_classify_stderr() {
        assert!(matches!(
            classify_stderr("Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            classify_stderr("Error response from daemon: No such container: abc"),
            BackendError::NotFound(_)
        ));
        assert!(matches!(
            classify_stderr(
                "Error response from daemon: Conflict. The container name \"/x\" is already in use"
            ),
            BackendError::Conflict(_)
        ));
        assert!(matches!(
            classify_stderr("Bind for 0.0.0.0:31000 failed: port is already allocated"),
            BackendError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_stderr("something odd happened"),
            BackendError::Failed(_)
        ));
    }

    #[test]
    fn test_parse_status_running_uses_ports_label() {
        let c = json!({
            "Id": "abc",
            "State": { "Running": true },
            "Config": { "Labels": { "roomforge.ports": "31005,31006" } },
            "HostConfig": { "PortBindings": { "8080/tcp": [{ "HostIp": "", "HostPort": "40000" }] } }
        });
        let status = parse_status(&c, "10.0.0.1");
        assert!(status.running);
        assert_eq!(status.endpoint, Some(Endpoint::new("10.0.0.1", 31005)));
    }

    #[test]
    fn test_parse_status_falls_back_to_port_bindings() {
        let c = json!({
            "State": { "Running": true },
            "Config": { "Labels": {} },
            "HostConfig": { "PortBindings": { "8080/tcp": [{ "HostIp": "", "HostPort": "40000" }] } }
        });
        assert_eq!(
            parse_status(&c, "127.0.0.1").endpoint,
            Some(Endpoint::new("127.0.0.1", 40000))
        );
    }

    #[test]
    fn test_parse_status_stopped_has_no_endpoint() {
        let c = json!({ "State": { "Running": false }, "Config": { "Labels": { "roomforge.ports": "31005" } } });
        let status = parse_status(&c, "127.0.0.1");
        assert!(!status.running);
        assert!(status.endpoint.is_none());
    }

    #[test]
    fn test_list_format_reads_each_label() {
        let format = list_format();
        assert!(format.starts_with(r#"{"id":{{json .ID}},"state":{{json .State}},"labels":{"#));
        assert!(format.contains(r#""roomforge.ports":{{json (.Label "roomforge.ports")}}"#));
        assert!(format.ends_with("}}"));
        assert_eq!(format.matches(".Label ").count(), labels::ALL.len());
    }

    #[test]
    fn test_parse_ps_lines() {
        let out = concat!(
            r#"{"id":"a1","state":"running","labels":{"roomforge.managed":"true","roomforge.room-name":"alice","roomforge.ports":"31000,31001","roomforge.template":""}}"#,
            "\n\n",
            r#"{"id":"b2","state":"exited","labels":{"roomforge.managed":"true"}}"#,
            "\n",
        );
        let list = parse_ps_lines(out).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].backend_ref, BackendRef::new("a1"));
        assert!(list[0].running);
        assert_eq!(list[0].labels["roomforge.room-name"], "alice");
        assert_eq!(list[0].labels[labels::PORTS], "31000,31001");
        assert!(!list[0].labels.contains_key(labels::TEMPLATE));
        assert!(!list[1].running);
        assert_eq!(list[1].labels.len(), 1);
    }

    #[test]
    fn test_parse_ps_lines_empty_and_garbage() {
        assert!(parse_ps_lines("").unwrap().is_empty());
        assert!(matches!(
            parse_ps_lines("not json"),
            Err(BackendError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = DockerBackend::new(DockerConfig {
            binary: "/nonexistent/roomforge-docker".into(),
            ..DockerConfig::default()
        });
        let err = backend.list().await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
