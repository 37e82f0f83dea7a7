//! Pooled HTTP client for talking to container backends
//!
//! Docker-backed containers forward requests and run readiness probes
//! through one shared pool so connections to a warm backend get reused.

use crate::container::{ProxyBody, ProxyRequest, ProxyResponse};
use crate::error::GateError;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests forwarded through the pool
    pub forwarded_requests: AtomicU64,
    /// Total number of readiness probes
    pub readiness_probes: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.forwarded_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.readiness_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_forwarded_requests(&self) -> u64 {
        self.forwarded_requests.load(Ordering::Relaxed)
    }

    pub fn get_readiness_probes(&self) -> u64 {
        self.readiness_probes.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to container backends
pub struct ConnectionPool {
    /// Main client for proxying requests
    client: Client<HttpConnector, ProxyBody>,
    /// Dedicated client for readiness probes (uses Empty body type)
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to the backend listening on `port`, streaming the
    /// backend's status, headers and body back verbatim.
    pub async fn send_request(
        &self,
        req: ProxyRequest,
        port: u16,
    ) -> Result<ProxyResponse, GateError> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            port,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let backend_req = builder
            .body(body)
            .map_err(|e| GateError::Transport(format!("failed to build backend request: {e}")))?;

        self.stats.record_request();

        let response = self
            .client
            .request(backend_req)
            .await
            .map_err(|e| GateError::Transport(e.to_string()))?;

        let (parts, body) = response.into_parts();
        Ok(ProxyResponse::from_parts(parts, body.boxed()))
    }

    /// Probe whether the backend on `port` answers `path` with a
    /// success-class status. Never raises; any failure is "not ready".
    pub async fn check_backend(&self, port: u16, path: &str) -> bool {
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.record_probe();

        match self.probe_client.request(req).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
