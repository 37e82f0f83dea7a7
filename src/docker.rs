//! Docker-backed containers via the Docker Engine API

use crate::clock::{sleep_for, Clock};
use crate::config::{RouteConfig, RouteType};
use crate::container::{Container, ProxyRequest, ProxyResponse};
use crate::error::GateError;
use crate::factory::ProtocolContainerFactory;
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// How often the readiness probe retries.
const READY_PROBE_INTERVAL_MS: u64 = 2_000;
/// How long a backend gets to answer its first successful probe.
const READY_BUDGET_MS: u64 = 60_000;
/// Wall-clock cap on a single probe attempt.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Grace period handed to `docker stop` before the daemon escalates.
const STOP_GRACE_SECS: i64 = 10;

/// Connection to the Docker daemon, shared by every Docker-backed container.
///
/// The client is connected and pinged lazily on first use, so a
/// configuration with no docker routes never touches the daemon.
pub struct DockerManager {
    docker_host: Option<String>,
    client: OnceCell<Docker>,
}

/// Shared reference to the Docker manager.
pub type SharedDockerManager = Arc<DockerManager>;

impl DockerManager {
    /// Create a manager that will connect on first use.
    ///
    /// Connection priority:
    /// 1. Explicit `docker_host` from configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub fn new(docker_host: Option<String>) -> SharedDockerManager {
        Arc::new(Self {
            docker_host,
            client: OnceCell::new(),
        })
    }

    async fn client(&self) -> anyhow::Result<&Docker> {
        self.client
            .get_or_try_init(|| async {
                let client = if let Some(ref host) = self.docker_host {
                    Self::connect_to_host(host)?
                } else if let Ok(host) = std::env::var("DOCKER_HOST") {
                    Self::connect_to_host(&host)?
                } else {
                    Self::connect_with_defaults()?
                };
                client.ping().await.map_err(|e| {
                    anyhow::anyhow!(
                        "Docker daemon is not responding: {}. \
                         Ensure Docker Desktop, Colima, or dockerd is running.",
                        e
                    )
                })?;
                debug!("Connected to Docker daemon");
                Ok(client)
            })
            .await
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let socket_paths = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in &socket_paths {
            if !path.starts_with('/') || !std::path::Path::new(path).exists() {
                continue;
            }
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
            {
                debug!(path, "Found Docker socket");
                return Ok(client);
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. Start dockerd, set DOCKER_HOST, \
                 or configure docker_host. Underlying error: {}",
                e
            )
        })
    }

    /// Pull an image unless it is already present locally.
    pub async fn pull_if_absent(&self, image: &str) -> anyhow::Result<()> {
        let client = self.client().await?;
        if client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress =
                progress.map_err(|e| anyhow::anyhow!("Failed to pull image '{}': {}", image, e))?;
            if let Some(error) = progress.error {
                anyhow::bail!("Failed to pull image '{}': {}", image, error);
            }
            if let Some(status) = progress.status {
                debug!(image, status, "Pull progress");
            }
        }
        info!(image, "Image pulled");
        Ok(())
    }

    /// Create and start a container for `image`, with all ports published and
    /// the backend's internal port announced via the PORT environment
    /// variable. Returns the container id.
    pub async fn create_and_start(
        &self,
        image: &str,
        internal_port: u16,
        domain: &str,
    ) -> anyhow::Result<String> {
        let client = self.client().await?;

        let container_name = format!("wakegate-{}", domain.replace('.', "-"));
        // A leftover container from an earlier run would collide on the name.
        let _ = self.remove(&container_name).await;

        let host_config = HostConfig {
            publish_all_ports: Some(true),
            ..Default::default()
        };
        let container_config = Config {
            image: Some(image.to_string()),
            env: Some(vec![format!("PORT={}", internal_port)]),
            host_config: Some(host_config),
            ..Default::default()
        };
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        let created = client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create container '{}' from image '{}': {}",
                    container_name,
                    image,
                    e
                )
            })?;

        client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                anyhow::anyhow!("Failed to start container '{}': {}", created.id, e)
            })?;

        info!(domain, container_id = %created.id, image, "Started container");
        Ok(created.id)
    }

    /// Read back the host port the daemon assigned to the backend's internal
    /// port.
    pub async fn assigned_host_port(
        &self,
        container_id: &str,
        internal_port: u16,
    ) -> anyhow::Result<u16> {
        let client = self.client().await?;
        let inspect = client.inspect_container(container_id, None).await?;

        let key = format!("{}/tcp", internal_port);
        inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&key).cloned())
            .flatten()
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|port| port.parse::<u16>().ok())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No host port binding for container {} port {}",
                    container_id,
                    key
                )
            })
    }

    /// Gracefully stop and remove a container. An already-stopped or
    /// already-gone container is not an error.
    pub async fn stop_and_remove(&self, container_id: &str) {
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                warn!(container_id, error = %e, "Docker unavailable while stopping container");
                return;
            }
        };

        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match client.stop_container(container_id, Some(options)).await {
            Ok(()) => info!(container_id, "Stopped container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(container_id, "Container was already stopped"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!(container_id, "Container not found"),
            Err(e) => warn!(container_id, error = %e, "Failed to stop container"),
        }

        self.remove(container_id).await;
    }

    /// Forcibly kill and remove a container. Never raises; a dead backend is
    /// logged and ignored.
    pub async fn kill_and_remove(&self, container_id: &str) {
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                warn!(container_id, error = %e, "Docker unavailable while killing container");
                return;
            }
        };

        match client.kill_container::<String>(container_id, None).await {
            Ok(()) => info!(container_id, "Killed container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!(container_id, "Container not found"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => debug!(container_id, "Container not running"),
            Err(e) => warn!(container_id, error = %e, "Failed to kill container"),
        }

        self.remove(container_id).await;
    }

    async fn remove(&self, container_id: &str) {
        let Ok(client) = self.client().await else {
            return;
        };
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match client.remove_container(container_id, Some(options)).await {
            Ok(()) => debug!(container_id, "Removed container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!(container_id, "Container not found"),
            Err(e) => warn!(container_id, error = %e, "Failed to remove container"),
        }
    }
}

#[derive(Default)]
struct ContainerState {
    container_id: Option<String>,
    host_port: u16,
}

/// A [`Container`] backed by a Docker container.
pub struct DockerBackedContainer {
    domain: String,
    image: String,
    internal_port: u16,
    route_type: RouteType,
    docker: SharedDockerManager,
    clock: Arc<dyn Clock>,
    pool: Arc<ConnectionPool>,
    state: parking_lot::Mutex<ContainerState>,
    // Serializes start so concurrent callers observe one successful start;
    // true once started. kill() never takes this lock.
    start_gate: tokio::sync::Mutex<bool>,
}

impl DockerBackedContainer {
    pub fn new(
        route: &RouteConfig,
        docker: SharedDockerManager,
        clock: Arc<dyn Clock>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            domain: route.domain.clone(),
            image: route.image.clone(),
            internal_port: route.port,
            route_type: route.route_type,
            docker,
            clock,
            pool,
            state: parking_lot::Mutex::new(ContainerState::default()),
            start_gate: tokio::sync::Mutex::new(false),
        }
    }

    /// Probe the backend's root endpoint until it answers with a
    /// success-class status, every 2 s up to a 60 s ceiling of clock time.
    async fn wait_until_ready(&self, host_port: u16) -> Result<(), GateError> {
        let deadline = self.clock.now() + READY_BUDGET_MS;
        loop {
            let probe = tokio::time::timeout(PROBE_TIMEOUT, self.pool.check_backend(host_port, "/"));
            if matches!(probe.await, Ok(true)) {
                debug!(domain = %self.domain, host_port, "backend is ready");
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(GateError::ReadinessTimeout {
                    port: host_port,
                    budget_ms: READY_BUDGET_MS,
                });
            }
            sleep_for(&self.clock, READY_PROBE_INTERVAL_MS).await;
        }
    }
}

#[async_trait]
impl Container for DockerBackedContainer {
    fn host_port(&self) -> u16 {
        self.state.lock().host_port
    }

    async fn start(&self) -> Result<(), GateError> {
        let mut started = self.start_gate.lock().await;
        if *started {
            return Ok(());
        }

        self.docker.pull_if_absent(&self.image).await?;
        let container_id = self
            .docker
            .create_and_start(&self.image, self.internal_port, &self.domain)
            .await?;
        // Record the id before anything that can hang, so a concurrent kill
        // has something to aim at.
        self.state.lock().container_id = Some(container_id.clone());

        let host_port = self
            .docker
            .assigned_host_port(&container_id, self.internal_port)
            .await?;
        self.state.lock().host_port = host_port;

        if self.route_type == RouteType::Http {
            self.wait_until_ready(host_port).await?;
        }

        *started = true;
        info!(domain = %self.domain, container_id = %container_id, host_port, "container started");
        Ok(())
    }

    async fn handle(&self, req: ProxyRequest) -> Result<ProxyResponse, GateError> {
        self.start().await?;
        let host_port = self.state.lock().host_port;
        self.pool.send_request(req, host_port).await
    }

    async fn shutdown(&self) {
        let container_id = self.state.lock().container_id.clone();
        match container_id {
            Some(id) => self.docker.stop_and_remove(&id).await,
            None => debug!(domain = %self.domain, "shutdown before any container was created"),
        }
    }

    async fn kill(&self) {
        let container_id = self.state.lock().container_id.clone();
        match container_id {
            Some(id) => self.docker.kill_and_remove(&id).await,
            None => debug!(domain = %self.domain, "kill before any container was created"),
        }
    }
}

/// Protocol sub-factory for `docker://` images.
pub struct DockerContainerFactory {
    docker: SharedDockerManager,
    clock: Arc<dyn Clock>,
    pool: Arc<ConnectionPool>,
}

impl DockerContainerFactory {
    pub fn new(
        docker: SharedDockerManager,
        clock: Arc<dyn Clock>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self { docker, clock, pool }
    }
}

impl ProtocolContainerFactory for DockerContainerFactory {
    fn schemes(&self) -> Vec<String> {
        vec!["docker".to_string()]
    }

    fn create(
        &self,
        _scheme: &str,
        route: &RouteConfig,
    ) -> Result<Arc<dyn Container>, GateError> {
        Ok(Arc::new(DockerBackedContainer::new(
            route,
            Arc::clone(&self.docker),
            Arc::clone(&self.clock),
            Arc::clone(&self.pool),
        )))
    }
}
