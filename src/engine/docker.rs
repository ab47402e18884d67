//! Docker Engine adapter backed by bollard.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::{API_DEFAULT_VERSION, Docker};
use tokio_stream::StreamExt;

use super::{
    ContainerEngine, ContainerSpec, EngineStatus, LabelSelector, LabeledContainer,
    NGINX_HTML_DIR,
};
use crate::error::EngineError;

/// Container port nginx listens on.
const NGINX_PORT: &str = "80/tcp";

/// Connect to the Docker daemon and verify it answers.
///
/// `host` accepts `unix://` and `tcp://` URLs; `None` uses the platform
/// defaults (`DOCKER_HOST` or the local socket). `timeout` bounds the ping;
/// `longest_call` is the client's transport timeout and must cover a stop
/// that waits out its full grace period.
pub async fn connect_docker(
    host: Option<&str>,
    timeout: Duration,
    longest_call: Duration,
) -> Result<Docker, EngineError> {
    let secs = longest_call.max(timeout).as_secs().max(1);
    let docker = match host {
        Some(h) if h.starts_with("unix://") => Docker::connect_with_unix(h, secs, API_DEFAULT_VERSION),
        Some(h) if h.starts_with("tcp://") || h.starts_with("http://") => {
            Docker::connect_with_http(h, secs, API_DEFAULT_VERSION)
        }
        Some(other) => {
            return Err(EngineError::Unavailable {
                reason: format!("unsupported docker host '{}'", other),
            });
        }
        None => Docker::connect_with_local_defaults(),
    }
    .map_err(|e| EngineError::Unavailable {
        reason: e.to_string(),
    })?;

    match tokio::time::timeout(timeout, docker.ping()).await {
        Ok(Ok(_)) => Ok(docker),
        Ok(Err(e)) => Err(EngineError::Unavailable {
            reason: format!("docker ping failed: {}", e),
        }),
        Err(_) => Err(EngineError::Timeout {
            operation: "ping",
            after: timeout,
        }),
    }
}

/// [`ContainerEngine`] over the Docker Engine HTTP API.
///
/// Holds only the shared client and the per-call timeout.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    timeout: Duration,
}

impl DockerEngine {
    pub fn new(docker: Docker, timeout: Duration) -> Self {
        Self { docker, timeout }
    }

    /// Run a daemon call under the adapter timeout.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, BollardError>>,
    ) -> Result<Result<T, BollardError>, EngineError> {
        self.bounded_for(self.timeout, operation, fut).await
    }

    async fn bounded_for<T>(
        &self,
        limit: Duration,
        operation: &'static str,
        fut: impl Future<Output = Result<T, BollardError>>,
    ) -> Result<Result<T, BollardError>, EngineError> {
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| EngineError::Timeout {
                operation,
                after: limit,
            })
    }

    fn classify(&self, operation: &'static str, target: &str, err: BollardError) -> EngineError {
        match err {
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                // create answers 404 for a missing image, which is a spec problem
                404 if operation == "create" => EngineError::SpecInvalid { reason: message },
                404 => EngineError::NotFound {
                    container_id: target.to_string(),
                },
                409 if operation == "create" => EngineError::Conflict {
                    name: target.to_string(),
                },
                400 => EngineError::SpecInvalid { reason: message },
                _ if is_exhaustion(&message) => EngineError::ResourceExhausted { reason: message },
                _ => EngineError::Unavailable {
                    reason: format!("{} {}: {} ({})", operation, target, message, status_code),
                },
            },
            BollardError::RequestTimeoutError => EngineError::Timeout {
                operation,
                after: self.timeout,
            },
            other => EngineError::Unavailable {
                reason: format!("{} {}: {}", operation, target, other),
            },
        }
    }
}

/// The daemon answers a stop only after the grace period, so the call gets
/// the grace period on top of the usual bound.
fn stop_deadline(timeout: Duration, grace: Duration) -> Duration {
    timeout.saturating_add(grace)
}

fn is_exhaustion(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "no space left",
        "port is already allocated",
        "address already in use",
        "out of memory",
        "cannot allocate memory",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// 304 Not Modified: container already in the requested state.
fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let host_config = HostConfig {
        binds: Some(vec![format!(
            "{}:{}:ro",
            spec.html_dir.display(),
            NGINX_HTML_DIR
        )]),
        port_bindings: Some(HashMap::from([(
            NGINX_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.host_port.to_string()),
            }]),
        )])),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        network_mode: Some("bridge".to_string()),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(HashMap::from([(NGINX_PORT.to_string(), HashMap::new())])),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.bounded("ping", self.docker.ping())
            .await?
            .map(|_| ())
            .map_err(|e| self.classify("ping", "daemon", e))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let response = self
            .bounded(
                "create",
                self.docker
                    .create_container(Some(options), container_config(spec)),
            )
            .await?
            .map_err(|e| self.classify("create", &spec.name, e))?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }
        tracing::debug!(container = %spec.name, id = %response.id, "Created container");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), EngineError> {
        match self
            .bounded(
                "start",
                self.docker
                    .start_container(container_id, None::<StartContainerOptions<String>>),
            )
            .await?
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(self.classify("start", container_id, e)),
        }
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self
            .bounded_for(
                stop_deadline(self.timeout, grace),
                "stop",
                self.docker.stop_container(container_id, Some(options)),
            )
            .await?
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(self.classify("stop", container_id, e)),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.bounded(
            "remove",
            self.docker.remove_container(container_id, Some(options)),
        )
        .await?
        .map_err(|e| self.classify("remove", container_id, e))
    }

    async fn inspect(&self, container_id: &str) -> Result<EngineStatus, EngineError> {
        let response = self
            .bounded(
                "inspect",
                self.docker
                    .inspect_container(container_id, None::<InspectContainerOptions>),
            )
            .await?
            .map_err(|e| self.classify("inspect", container_id, e))?;

        let state = response.state.unwrap_or_default();
        let status = match (state.status, state.running) {
            (Some(status), _) => EngineStatus::from_docker_state(&status.to_string()),
            (None, Some(true)) => EngineStatus::Running,
            (None, Some(false)) => EngineStatus::Exited,
            (None, None) => EngineStatus::Unknown,
        };
        Ok(status)
    }

    async fn list_by_label(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<LabeledContainer>, EngineError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), selector.to_filters())]),
            ..Default::default()
        };
        let summaries = self
            .bounded("list", self.docker.list_containers(Some(options)))
            .await?
            .map_err(|e| self.classify("list", "containers", e))?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let status = summary
                    .state
                    .as_deref()
                    .map(EngineStatus::from_docker_state)
                    .unwrap_or(EngineStatus::Unknown);
                Some(LabeledContainer {
                    id,
                    labels: summary.labels.unwrap_or_default(),
                    status,
                })
            })
            .collect())
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String, EngineError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let collect = async {
            let stream = self.docker.logs(container_id, Some(options));
            tokio::pin!(stream);
            let mut out = String::new();
            while let Some(chunk) = stream.next().await {
                out.push_str(&chunk?.to_string());
            }
            Ok::<_, BollardError>(out)
        };
        self.bounded("logs", collect)
            .await?
            .map_err(|e| self.classify("logs", container_id, e))
    }
}
