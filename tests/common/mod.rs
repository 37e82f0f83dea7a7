//! Shared test doubles: dummy containers, counting factory, static router

// Each integration test binary compiles this module and uses its own subset.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use wakegate::config::{RouteConfig, RouteType};
use wakegate::container::{full_body, Container, ProxyRequest, ProxyResponse};
use wakegate::error::GateError;
use wakegate::factory::ContainerFactory;
use wakegate::router::RequestRouter;

/// Let spawned tasks run up to their next suspension point, so assertions
/// after a clock advance observe their effects deterministically.
pub async fn drain_tasks() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Build an HTTP route for tests.
pub fn http_route(domain: &str, keep_warm_seconds: u64) -> RouteConfig {
    RouteConfig {
        domain: domain.to_string(),
        image: "dummy://dummy".to_string(),
        keep_warm_seconds,
        port: 8080,
        route_type: RouteType::Http,
    }
}

/// Router that answers every lookup with the same (optional) route.
pub struct StaticRouter(pub Option<RouteConfig>);

impl RequestRouter for StaticRouter {
    fn route(&self, _host: &str) -> Option<RouteConfig> {
        self.0.clone()
    }
}

/// Factory that counts create calls and hands out containers from a
/// supplier.
pub struct CountingFactory {
    pub creates: AtomicUsize,
    supplier: Box<dyn Fn() -> Arc<dyn Container> + Send + Sync>,
}

impl CountingFactory {
    /// Always return the same container instance.
    pub fn fixed(container: Arc<dyn Container>) -> Arc<Self> {
        Arc::new(Self {
            creates: AtomicUsize::new(0),
            supplier: Box::new(move || Arc::clone(&container)),
        })
    }

    /// Build a fresh container per create call.
    pub fn with_supplier(
        supplier: impl Fn() -> Arc<dyn Container> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            creates: AtomicUsize::new(0),
            supplier: Box::new(supplier),
        })
    }
}

impl ContainerFactory for CountingFactory {
    fn create(&self, _route: &RouteConfig) -> Result<Arc<dyn Container>, GateError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok((self.supplier)())
    }
}

/// Dummy container whose lifecycle operations can be made to hang or fail,
/// with counters for every call.
#[derive(Default)]
pub struct CrashDummyContainer {
    pub start_forever: bool,
    pub handle_forever: bool,
    pub shutdown_forever: bool,
    pub fail_start: bool,
    pub fail_handle: bool,
    pub started: AtomicUsize,
    pub handled: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub killed: AtomicUsize,
}

impl CrashDummyContainer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hanging_start() -> Arc<Self> {
        Arc::new(Self {
            start_forever: true,
            ..Default::default()
        })
    }

    pub fn hanging_handle() -> Arc<Self> {
        Arc::new(Self {
            handle_forever: true,
            ..Default::default()
        })
    }

    pub fn hanging_shutdown() -> Arc<Self> {
        Arc::new(Self {
            shutdown_forever: true,
            ..Default::default()
        })
    }

    pub fn failing_start() -> Arc<Self> {
        Arc::new(Self {
            fail_start: true,
            ..Default::default()
        })
    }

    pub fn failing_handle() -> Arc<Self> {
        Arc::new(Self {
            fail_handle: true,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Container for CrashDummyContainer {
    fn host_port(&self) -> u16 {
        0
    }

    async fn start(&self) -> Result<(), GateError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(GateError::ReadinessTimeout {
                port: 0,
                budget_ms: 60_000,
            });
        }
        if self.start_forever {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn handle(&self, _req: ProxyRequest) -> Result<ProxyResponse, GateError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if self.fail_handle {
            return Err(GateError::Transport("connection reset by backend".into()));
        }
        if self.handle_forever {
            futures::future::pending::<()>().await;
        }
        Ok(hyper::Response::builder()
            .status(200)
            .body(full_body("dummy"))
            .expect("valid response"))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.shutdown_forever {
            futures::future::pending::<()>().await;
        }
    }

    async fn kill(&self) {
        self.killed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Container that answers every request with a fixed greeting.
pub struct HelloContainer;

#[async_trait]
impl Container for HelloContainer {
    fn host_port(&self) -> u16 {
        0
    }

    async fn start(&self) -> Result<(), GateError> {
        Ok(())
    }

    async fn handle(&self, _req: ProxyRequest) -> Result<ProxyResponse, GateError> {
        Ok(hyper::Response::builder()
            .status(200)
            .header("Content-Type", "text/plain")
            .body(full_body("Hello World"))
            .expect("valid response"))
    }

    async fn shutdown(&self) {}

    async fn kill(&self) {}
}

/// Container backed by a real TCP listener that writes a fixed payload to
/// every connection.
#[derive(Default)]
pub struct TcpDummyContainer {
    port: Mutex<u16>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TcpDummyContainer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Container for TcpDummyContainer {
    fn host_port(&self) -> u16 {
        *self.port.lock()
    }

    async fn start(&self) -> Result<(), GateError> {
        if self.task.lock().is_some() {
            return Ok(());
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| GateError::Transport(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| GateError::Transport(e.to_string()))?
            .port();
        *self.port.lock() = port;
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"tcp").await;
                let _ = stream.shutdown().await;
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn handle(&self, _req: ProxyRequest) -> Result<ProxyResponse, GateError> {
        Err(GateError::Transport("not an HTTP backend".into()))
    }

    async fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn kill(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Container backed by a real UDP socket that answers every datagram with a
/// fixed payload.
#[derive(Default)]
pub struct UdpDummyContainer {
    port: Mutex<u16>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UdpDummyContainer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Container for UdpDummyContainer {
    fn host_port(&self) -> u16 {
        *self.port.lock()
    }

    async fn start(&self) -> Result<(), GateError> {
        if self.task.lock().is_some() {
            return Ok(());
        }
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0")
            .await
            .map_err(|e| GateError::Transport(e.to_string()))?;
        let port = socket
            .local_addr()
            .map_err(|e| GateError::Transport(e.to_string()))?
            .port();
        *self.port.lock() = port;
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 65_535];
            while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(b"udp", peer).await;
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn handle(&self, _req: ProxyRequest) -> Result<ProxyResponse, GateError> {
        Err(GateError::Transport("not an HTTP backend".into()))
    }

    async fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn kill(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
