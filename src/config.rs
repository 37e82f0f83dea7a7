use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Route definitions
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP listener port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle backend connections per host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle backend connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Docker host URL (default: probe DOCKER_HOST, then common sockets)
    pub docker_host: Option<String>,
}

impl ServerConfig {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            docker_host: None,
        }
    }
}

/// Protocol a route speaks to its clients
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    /// Routed by Host header through the shared HTTP listener (default)
    #[default]
    Http,
    /// Dedicated TCP listener on the route's port
    Tcp,
    /// Dedicated UDP socket on the route's port
    Udp,
}

/// A configured mapping from an external identity to a backend workload.
///
/// Loaded once at startup and read-only thereafter.
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    /// Routing key: the Host header for HTTP routes, an identity label for
    /// TCP/UDP routes
    pub domain: String,

    /// Backend image reference, prefixed with the factory scheme
    /// (e.g. "docker://nginx:alpine")
    pub image: String,

    /// Seconds a container may sit idle before the sweep retires it
    #[serde(default = "default_keep_warm_seconds")]
    pub keep_warm_seconds: u64,

    /// Port the backend listens on inside the container (announced to it via
    /// the PORT environment variable). For TCP/UDP routes this is also the
    /// public listening port.
    pub port: u16,

    /// Protocol kind: "http" (default), "tcp" or "udp"
    #[serde(default, rename = "type")]
    pub route_type: RouteType,
}

impl RouteConfig {
    /// Idle threshold in milliseconds, as compared against access stamps.
    pub fn keep_warm_ms(&self) -> u64 {
        self.keep_warm_seconds * 1000
    }

    fn validate(&self) -> Result<(), String> {
        if self.domain.is_empty() {
            return Err("route with empty 'domain'".to_string());
        }
        if self.image.is_empty() {
            return Err(format!("route '{}': 'image' must not be empty", self.domain));
        }
        if self.port == 0 {
            return Err(format!(
                "route '{}': 'port' must be greater than 0",
                self.domain
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate route definitions.
    ///
    /// A malformed image scheme is not caught here: it surfaces per-route at
    /// container construction so other routes keep working.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut domains = HashSet::new();
        let mut ports = HashSet::new();
        for route in &self.routes {
            route.validate().map_err(|e| anyhow::anyhow!(e))?;
            if !domains.insert(route.domain.as_str()) {
                anyhow::bail!("duplicate route domain '{}'", route.domain);
            }
            // TCP/UDP routes own a listening socket; two of them on the same
            // port cannot both bind. HTTP routes share the server port.
            if route.route_type != RouteType::Http && !ports.insert(route.port) {
                anyhow::bail!(
                    "route '{}': listening port {} is already taken by another route",
                    route.domain,
                    route.port
                );
            }
        }
        Ok(())
    }
}

// Default value functions

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_keep_warm_seconds() -> u64 {
    300
}
