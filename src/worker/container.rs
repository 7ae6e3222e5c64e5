//! Docker container lifecycle for conversion workers.
//!
//! Each job gets a fresh, uniquely named container running the conversion
//! service in subprocess mode. The container's service port is published to
//! an ephemeral loopback port on the host; the input file is fetched back
//! through the orchestrator's file bridge.
//!
//! # Container Setup
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                     pdf_converter_<job_id>                              │
//! │                                                                         │
//! │  Environment:                                                           │
//! │    S3_* / PDF_EXPIRE_TIME / DOWNLOAD_URL_PREFIX  (worker uploads itself)│
//! │    WORKER_BACKEND=subprocess                                            │
//! │                                                                         │
//! │  Ports:                                                                 │
//! │    7758/tcp ─▶ 127.0.0.1:<ephemeral>                                    │
//! │                                                                         │
//! │  Input:                                                                 │
//! │    GET http://<bridge_host>:<bridge_port>/temp/<job_id>/<file>?token=.. │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;

use crate::worker::error::{Result, WorkerError};

/// Name prefix for every worker container this service creates.
pub const CONTAINER_PREFIX: &str = "pdf_converter_";

/// Manages Docker container lifecycle.
pub struct ContainerRunner {
    docker: Docker,
    image: String,
    container_port: u16,
    poll_interval: Duration,
    stop_grace: Duration,
    http: reqwest::Client,
}

impl ContainerRunner {
    /// Create a new container runner.
    pub fn new(
        docker: Docker,
        image: String,
        container_port: u16,
        poll_interval: Duration,
        stop_grace: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            docker,
            image,
            container_port,
            poll_interval,
            stop_grace,
            http,
        }
    }

    /// Check if the Docker daemon is available.
    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Check if the worker image exists locally.
    pub async fn image_exists(&self) -> bool {
        self.docker.inspect_image(&self.image).await.is_ok()
    }

    /// Pull the worker image.
    pub async fn pull_image(&self) -> Result<()> {
        use bollard::image::CreateImageOptions;

        tracing::info!("Pulling worker image: {}", self.image);

        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(WorkerError::ContainerCreationFailed {
                        reason: format!("image pull failed: {}", e),
                    });
                }
            }
        }

        tracing::info!("Successfully pulled image: {}", self.image);
        Ok(())
    }

    /// Host port the container port is published on, once Docker reports it.
    async fn host_port(&self, container_id: &str) -> Result<Option<u16>> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;

        if let Some(state) = info.state.as_ref()
            && state.running == Some(false)
            && state.status.is_some()
        {
            return Err(WorkerError::ContainerStartFailed {
                reason: format!(
                    "container exited before becoming ready (exit code {:?})",
                    state.exit_code
                ),
            });
        }

        let port = info
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|ports| ports.get(&self.port_key()).cloned().flatten())
            .and_then(|bindings| {
                bindings
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))
            })
            .filter(|p| *p != 0);

        Ok(port)
    }

    async fn force_remove(&self, container_id: &str) {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => tracing::debug!(container = container_id, "Container removed"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => {
                tracing::error!(container = container_id, "Failed to remove container: {}", e)
            }
        }
    }

    /// Force-remove worker containers left behind by a previous process.
    pub async fn reap_orphans(&self) -> Result<usize> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "name".to_string(),
                vec![CONTAINER_PREFIX.to_string()],
            )]),
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        let mut reaped = 0;
        for summary in containers {
            let named_ours = summary.names.iter().flatten().any(|n| {
                n.trim_start_matches('/').starts_with(CONTAINER_PREFIX)
            });
            if let (true, Some(id)) = (named_ours, summary.id) {
                tracing::warn!(container = %id, "Removing orphaned worker container");
                self.force_remove(&id).await;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    fn port_key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }
}

/// Starts, health-checks and removes worker containers.
///
/// [`ContainerRunner`] is the Docker implementation; the lifecycle manager
/// only talks to this trait.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a named container. Returns the container id.
    async fn start(&self, name: &str, env: HashMap<String, String>) -> Result<String>;

    /// Wait until the container serves `/health`. Returns its base URL.
    async fn wait_until_ready(
        &self,
        container_id: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<String>;

    /// Stop and force-remove. Never fails; problems are logged.
    async fn stop_and_remove(&self, container_id: &str);
}

#[async_trait]
impl ContainerRuntime for ContainerRunner {
    /// Create and start a named container. Returns the container id.
    ///
    /// If start fails the created container is removed before returning.
    async fn start(&self, name: &str, env: HashMap<String, String>) -> Result<String> {
        let port_key = self.port_key();

        let env_vec: Vec<String> = env
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                // Empty host port asks Docker for an ephemeral one.
                host_port: Some(String::new()),
            }]),
        )]);

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            auto_remove: Some(false),
            network_mode: Some("bridge".to_string()),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(self.image.clone()),
            env: Some(env_vec),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(
                "convert2pdf.worker".to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| WorkerError::ContainerCreationFailed {
                reason: e.to_string(),
            })?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.force_remove(&response.id).await;
            return Err(WorkerError::ContainerStartFailed {
                reason: e.to_string(),
            });
        }

        Ok(response.id)
    }

    /// Poll until the published host port is known and the worker's
    /// `/health` answers, or `timeout` elapses. Returns the worker base URL.
    async fn wait_until_ready(
        &self,
        container_id: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<String> {
        let ready = tokio::time::timeout(timeout, async {
            let host_port = loop {
                if let Some(port) = self.host_port(container_id).await? {
                    break port;
                }
                tokio::time::sleep(self.poll_interval).await;
            };
            tracing::debug!(container = name, host_port, "Port mapping resolved");

            let base_url = format!("http://127.0.0.1:{}", host_port);
            let health_url = format!("{}/health", base_url);
            loop {
                match self.http.get(&health_url).send().await {
                    Ok(resp) if resp.status().is_success() => break,
                    Ok(resp) => {
                        tracing::trace!(container = name, status = %resp.status(), "Worker not healthy yet")
                    }
                    Err(e) => tracing::trace!(container = name, "Worker not reachable yet: {}", e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
            Ok::<_, WorkerError>(base_url)
        })
        .await;

        match ready {
            Ok(result) => result,
            Err(_) => Err(WorkerError::ReadinessTimeout {
                worker: name.to_string(),
                waited: timeout,
            }),
        }
    }

    /// Stop with the configured grace period, then force-remove.
    ///
    /// Failures are logged and swallowed: a leaked container must never
    /// change the outcome of the job it served.
    async fn stop_and_remove(&self, container_id: &str) {
        let grace = self.stop_grace.as_secs() as i64;
        if let Err(e) = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: grace }))
            .await
        {
            tracing::warn!(container = container_id, "Failed to stop container: {}", e);
        }
        self.force_remove(container_id).await;
    }
}

/// Container name for a job.
pub fn container_name(job_id: &str) -> String {
    format!("{}{}", CONTAINER_PREFIX, job_id)
}

/// Connect to the Docker daemon.
///
/// Tries these locations in order:
/// 1. `DOCKER_HOST` env var (bollard default)
/// 2. `/var/run/docker.sock` (Linux default)
/// 3. `~/.docker/run/docker.sock` (Docker Desktop on macOS)
pub async fn connect_docker() -> Result<Docker> {
    if let Ok(docker) = Docker::connect_with_local_defaults()
        && docker.ping().await.is_ok()
    {
        return Ok(docker);
    }

    if let Some(home) = std::env::var_os("HOME") {
        let desktop_sock = std::path::Path::new(&home).join(".docker/run/docker.sock");
        if desktop_sock.exists() {
            let sock_str = desktop_sock.to_string_lossy();
            if let Ok(docker) =
                Docker::connect_with_socket(&sock_str, 120, bollard::API_DEFAULT_VERSION)
                && docker.ping().await.is_ok()
            {
                return Ok(docker);
            }
        }
    }

    Err(WorkerError::DockerNotAvailable {
        reason: "Socket not found: /var/run/docker.sock".to_string(),
    })
}
