//! TCP and UDP relays: per-route listeners for non-HTTP routes
//!
//! Each TCP/UDP route owns one listening socket, bound at startup on the
//! route's configured port. The route is resolved once at bind time; those
//! protocols carry no per-packet host identity.

use crate::config::RouteConfig;
use crate::nursery::ContainerNursery;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Largest datagram a UDP relay will carry.
const MAX_DATAGRAM: usize = 65_535;
/// Cap on the wait for a backend's single reply datagram. The one-shot
/// request/reply model has no other way to reclaim the task.
const UDP_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// One dedicated TCP listener for a TCP route. Every accepted connection
/// wakes the route's container and splices bytes both ways until both
/// directions finish.
pub struct TcpRelay {
    route: RouteConfig,
    bind: String,
    nursery: Arc<ContainerNursery>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TcpRelay {
    pub fn new(
        route: RouteConfig,
        bind: String,
        nursery: Arc<ContainerNursery>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            route,
            bind,
            nursery,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind, self.route.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(domain = %self.route.domain, addr, "TCP relay listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let nursery = Arc::clone(&self.nursery);
                            let route = self.route.clone();
                            tokio::spawn(async move {
                                splice_connection(stream, peer, route, nursery).await;
                            });
                        }
                        Err(e) => {
                            warn!(domain = %self.route.domain, error = %e, "Failed to accept TCP connection");
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!(domain = %self.route.domain, "TCP relay shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn splice_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    route: RouteConfig,
    nursery: Arc<ContainerNursery>,
) {
    let container = match nursery.acquire(&route).await {
        Ok(container) => container,
        Err(e) => {
            warn!(domain = %route.domain, peer = %peer, error = %e, "Failed to obtain container for TCP connection");
            return;
        }
    };

    let backend_addr = format!("127.0.0.1:{}", container.host_port());
    let mut backend = match TcpStream::connect(&backend_addr).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(domain = %route.domain, backend_addr, error = %e, "Failed to connect to backend");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, to_client)) => {
            debug!(
                domain = %route.domain,
                peer = %peer,
                to_backend,
                to_client,
                "TCP connection closed"
            );
        }
        Err(e) => {
            debug!(domain = %route.domain, peer = %peer, error = %e, "TCP connection closed with error");
        }
    }
}

/// One dedicated UDP socket for a UDP route. Each datagram is a one-shot
/// request/reply exchange with the backend; no session state is kept.
pub struct UdpRelay {
    route: RouteConfig,
    bind: String,
    nursery: Arc<ContainerNursery>,
    shutdown_rx: watch::Receiver<bool>,
}

impl UdpRelay {
    pub fn new(
        route: RouteConfig,
        bind: String,
        nursery: Arc<ContainerNursery>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            route,
            bind,
            nursery,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind, self.route.port);
        let socket = Arc::new(UdpSocket::bind(&addr).await?);
        info!(domain = %self.route.domain, addr, "UDP relay listening");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => {
                            let datagram = buf[..len].to_vec();
                            let socket = Arc::clone(&socket);
                            let nursery = Arc::clone(&self.nursery);
                            let route = self.route.clone();
                            tokio::spawn(async move {
                                relay_datagram(socket, datagram, peer, route, nursery).await;
                            });
                        }
                        Err(e) => {
                            warn!(domain = %self.route.domain, error = %e, "Failed to receive datagram");
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!(domain = %self.route.domain, "UDP relay shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Forward one datagram to the backend over an ephemeral socket, wait for
/// exactly one reply, and relay it back to the original sender.
async fn relay_datagram(
    socket: Arc<UdpSocket>,
    datagram: Vec<u8>,
    peer: SocketAddr,
    route: RouteConfig,
    nursery: Arc<ContainerNursery>,
) {
    let container = match nursery.acquire(&route).await {
        Ok(container) => container,
        Err(e) => {
            warn!(domain = %route.domain, peer = %peer, error = %e, "Failed to obtain container for datagram");
            return;
        }
    };

    let backend = match UdpSocket::bind("127.0.0.1:0").await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(domain = %route.domain, error = %e, "Failed to bind ephemeral socket");
            return;
        }
    };

    let backend_addr = format!("127.0.0.1:{}", container.host_port());
    if let Err(e) = backend.send_to(&datagram, &backend_addr).await {
        warn!(domain = %route.domain, backend_addr, error = %e, "Failed to forward datagram");
        return;
    }

    let mut reply = vec![0u8; MAX_DATAGRAM];
    let reply_len = match tokio::time::timeout(UDP_REPLY_TIMEOUT, backend.recv(&mut reply)).await {
        Ok(Ok(len)) => len,
        Ok(Err(e)) => {
            warn!(domain = %route.domain, error = %e, "Failed to read backend reply");
            return;
        }
        Err(_) => {
            warn!(
                domain = %route.domain,
                timeout_secs = UDP_REPLY_TIMEOUT.as_secs(),
                "Backend never replied to datagram"
            );
            return;
        }
    };

    if let Err(e) = socket.send_to(&reply[..reply_len], peer).await {
        warn!(domain = %route.domain, peer = %peer, error = %e, "Failed to relay reply");
    }
}
