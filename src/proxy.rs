//! The HTTP forwarder: Host-header-routed front end for all HTTP routes

use crate::container::{ProxyBody, ProxyRequest};
use crate::error::{json_error_response, GateError, ProxyErrorCode};
use crate::nursery::ContainerNursery;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The shared HTTP listener serving every HTTP route.
pub struct HttpProxy {
    listener: TcpListener,
    nursery: Arc<ContainerNursery>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HttpProxy {
    /// Bind the listening socket. Serving starts with [`run`](Self::run).
    pub async fn bind(
        bind_addr: SocketAddr,
        nursery: Arc<ContainerNursery>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            nursery,
            shutdown_rx,
        })
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "HTTP proxy listening (HTTP/1.1 and HTTP/2)");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let nursery = Arc::clone(&self.nursery);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, nursery).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("HTTP proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    nursery: Arc<ContainerNursery>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let nursery = Arc::clone(&nursery);
        async move { handle_request(req, nursery, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// One request: resolve the host, obtain a ready container from the nursery,
/// forward, and map failures to error responses. Failures never escape as
/// connection errors.
async fn handle_request(
    mut req: Request<Incoming>,
    nursery: Arc<ContainerNursery>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let hostname = match extract_hostname(&req) {
        Some(hostname) => hostname,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite X-Forwarded-* rather than appending: this proxy is the first
    // trusted hop and client-provided values must not survive.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let container = match nursery.get_or_create(&hostname).await {
        Ok(Some(container)) => container,
        Ok(None) => {
            return Ok(json_error_response(
                ProxyErrorCode::RouteNotFound,
                format!("No route found for {}", hostname),
            ));
        }
        Err(e) => {
            error!(hostname, request_id, error = %e, "Failed to obtain container");
            let code = if e.is_configuration() {
                ProxyErrorCode::ConfigurationError
            } else {
                ProxyErrorCode::StartFailed
            };
            return Ok(json_error_response(code, e.to_string()));
        }
    };

    let req: ProxyRequest = req.map(|body| body.boxed());
    match nursery.forward_request(&hostname, &container, req).await {
        Ok(response) => Ok(response),
        Err(e @ GateError::OperationTimeout { .. }) => {
            warn!(hostname, request_id, error = %e, "Request timed out");
            Ok(json_error_response(ProxyErrorCode::RequestTimeout, e.to_string()))
        }
        Err(e) => {
            error!(hostname, request_id, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ProxyFailed,
                format!("Error proxying request: {}", e),
            ))
        }
    }
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Alphanumeric, hyphen and dot only; anything else invites log
            // injection.
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}
