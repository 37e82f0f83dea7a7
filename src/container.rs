//! The container capability contract
//!
//! A [`Container`] is one unit of backing compute for a route. The nursery
//! only ever talks to backends through this trait; how start/handle/shutdown
//! reach the concrete runtime is a per-variant detail.

use crate::error::GateError;
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;
/// An inbound request handed to a container.
pub type ProxyRequest = Request<ProxyBody>;
/// A backend response streamed back to the caller.
pub type ProxyResponse = Response<ProxyBody>;

/// Box a fixed byte payload into a [`ProxyBody`].
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// One unit of backing compute with a start/serve/stop/kill lifecycle.
///
/// Lifecycle: constructed (not started) -> started -> zero or more `handle`
/// calls -> `shutdown` or `kill`, both terminal. A container that was shut
/// down or killed is never reused; the nursery constructs a fresh instance
/// for the next request.
///
/// Any of these methods may be invoked from concurrent paths (a request in
/// flight while the sweep retires the container, a kill racing a hung
/// start), so implementations must uphold the idempotence and no-raise
/// guarantees below without deadlocking on their own state.
#[async_trait]
pub trait Container: Send + Sync {
    /// Host-reachable port assigned by the backend. Only valid once
    /// `start` has completed.
    fn host_port(&self) -> u16;

    /// Bring the backend to a ready state. Idempotent: calls after the
    /// first successful start are no-ops. May block for as long as the
    /// backend takes to become reachable; the nursery bounds it.
    async fn start(&self) -> Result<(), GateError>;

    /// Service exactly one inbound interaction by forwarding it to the
    /// running backend. Starts the backend first if `start` has not
    /// completed yet.
    async fn handle(&self, req: ProxyRequest) -> Result<ProxyResponse, GateError>;

    /// Gracefully stop and release backend resources. Terminal. Safe to
    /// call even if `start` never completed; failures are logged, not
    /// raised.
    async fn shutdown(&self);

    /// Forcibly terminate backend resources without waiting for graceful
    /// cooperation. Terminal, must not block indefinitely, and tolerates an
    /// already-dead backend (logged, not raised). Invoked only as timeout
    /// escalation.
    async fn kill(&self);
}

impl std::fmt::Debug for dyn Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("host_port", &self.host_port()).finish()
    }
}
