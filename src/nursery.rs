//! The container nursery: lifecycle orchestration for all active containers
//!
//! Owns the live container set, guarantees single-flight construction per
//! domain, bounds every lifecycle call with the timeout/kill escalation, and
//! runs the periodic idle sweep. All timing goes through [`Clock`], so every
//! property here is testable on virtual time.

use crate::clock::{Clock, ScheduledTask};
use crate::config::RouteConfig;
use crate::container::{Container, ProxyRequest, ProxyResponse};
use crate::error::GateError;
use crate::factory::ContainerFactory;
use crate::router::RequestRouter;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Budget for bringing a container to readiness.
pub const START_BUDGET_MS: u64 = 60_000;
/// Budget for one proxied request.
pub const REQUEST_BUDGET_MS: u64 = 300_000;
/// Budget for a graceful shutdown before escalation.
pub const SHUTDOWN_BUDGET_MS: u64 = 60_000;
/// Interval between idle sweep passes.
const SWEEP_INTERVAL_MS: u64 = 10_000;

/// Everything the nursery tracks for one active domain.
///
/// Container, route policy and access stamp live in one map entry so that
/// retiring a domain removes all three atomically.
struct DomainEntry {
    container: Arc<dyn Container>,
    route: RouteConfig,
    last_access_ms: AtomicU64,
}

impl DomainEntry {
    fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_access_ms.load(Ordering::SeqCst))
    }
}

/// Cancels the pending timer when the bounded operation settles first.
struct TimerGuard(ScheduledTask);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Run `op` under `budget_ms` of clock time, escalating to `kill` on overrun.
///
/// The operation runs on its own task; a timer races it on the clock's
/// scheduling context, so a hung operation can never block its own
/// escalation. If the timer wins it kills the container, aborts the
/// operation task and the call site observes [`GateError::OperationTimeout`].
async fn run_bounded<T, F>(
    clock: &Arc<dyn Clock>,
    op: &'static str,
    budget_ms: u64,
    container: &Arc<dyn Container>,
    fut: F,
) -> Result<T, GateError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, GateError>> + Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    let abort = handle.abort_handle();
    let (expired_tx, expired_rx) = oneshot::channel::<()>();

    let victim = Arc::clone(container);
    let timer = clock.schedule(
        clock.now() + budget_ms,
        Box::new(move || {
            Box::pin(async move {
                warn!(op, budget_ms, "operation overran its budget, killing container");
                victim.kill().await;
                abort.abort();
                let _ = expired_tx.send(());
            }) as BoxFuture<'static, ()>
        }),
    );
    let _timer = TimerGuard(timer);

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(GateError::OperationTimeout { op, budget_ms }),
            Err(e) => Err(GateError::Runtime(anyhow::anyhow!("{op} task failed: {e}"))),
        },
        _ = expired_rx => Err(GateError::OperationTimeout { op, budget_ms }),
    }
}

/// Retire one container: bounded graceful shutdown, kill on overrun.
async fn retire(clock: &Arc<dyn Clock>, domain: &str, container: &Arc<dyn Container>) {
    let c = Arc::clone(container);
    match run_bounded(clock, "shutdown", SHUTDOWN_BUDGET_MS, container, async move {
        c.shutdown().await;
        Ok(())
    })
    .await
    {
        Ok(()) => debug!(domain, "container retired"),
        Err(e) => warn!(domain, error = %e, "graceful shutdown failed, container killed"),
    }
}

/// The orchestrator that owns container lifecycle state.
///
/// Per-domain state machine: absent -> active -> (idle-expired |
/// explicit-shutdown | killed) -> absent. A retired container is never
/// reused; the next request for its domain constructs a new instance.
pub struct ContainerNursery {
    router: Arc<dyn RequestRouter>,
    clock: Arc<dyn Clock>,
    factory: Arc<dyn ContainerFactory>,
    active: DashMap<String, DomainEntry>,
    sweep_task: Mutex<Option<ScheduledTask>>,
    closed: AtomicBool,
}

impl ContainerNursery {
    /// Create a nursery and arm its idle sweep.
    ///
    /// Returns `Arc<Self>` because the sweep and the bounded operations run
    /// on background tasks that share the nursery.
    pub fn new(
        router: Arc<dyn RequestRouter>,
        clock: Arc<dyn Clock>,
        factory: Arc<dyn ContainerFactory>,
    ) -> Arc<Self> {
        let nursery = Arc::new(Self {
            router,
            clock,
            factory,
            active: DashMap::new(),
            sweep_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        Self::arm_sweep(&nursery);
        nursery
    }

    /// Resolve `host` to a route and return its ready container, creating
    /// and starting one if needed. `Ok(None)` means no route is configured
    /// for the host.
    pub async fn get_or_create(
        &self,
        host: &str,
    ) -> Result<Option<Arc<dyn Container>>, GateError> {
        let Some(route) = self.router.route(host) else {
            debug!(host, "no route configured");
            return Ok(None);
        };
        self.acquire(&route).await.map(Some)
    }

    /// Return the ready container for a known route, creating and starting
    /// one if needed. Used directly by the TCP/UDP relays, whose route is
    /// fixed at bind time.
    pub async fn acquire(&self, route: &RouteConfig) -> Result<Arc<dyn Container>, GateError> {
        let now = self.clock.now();

        // Atomic check-and-insert under the shard lock: two simultaneous
        // first requests observe the same container, and construction runs
        // at most once. The access stamp is refreshed here, before the
        // bounded start, so a slow start never looks idle to the sweep.
        let container = match self.active.entry(route.domain.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                existing.last_access_ms.store(now, Ordering::SeqCst);
                Arc::clone(&existing.container)
            }
            Entry::Vacant(slot) => {
                let container = self.factory.create(route)?;
                info!(domain = %route.domain, image = %route.image, "created container");
                slot.insert(DomainEntry {
                    container: Arc::clone(&container),
                    route: route.clone(),
                    last_access_ms: AtomicU64::new(now),
                });
                container
            }
        };

        let c = Arc::clone(&container);
        match run_bounded(
            &self.clock,
            "start",
            START_BUDGET_MS,
            &container,
            async move { c.start().await },
        )
        .await
        {
            Ok(()) => Ok(container),
            Err(e) => {
                // The container is terminal after a failed or killed start;
                // drop its entry so the next request builds a fresh one.
                if !matches!(e, GateError::OperationTimeout { .. }) {
                    container.kill().await;
                }
                self.active
                    .remove_if(&route.domain, |_, entry| {
                        Arc::ptr_eq(&entry.container, &container)
                    });
                warn!(domain = %route.domain, error = %e, "container start failed");
                Err(e)
            }
        }
    }

    /// Run one request against a container under the request budget.
    pub async fn forward_request(
        &self,
        domain: &str,
        container: &Arc<dyn Container>,
        req: ProxyRequest,
    ) -> Result<ProxyResponse, GateError> {
        let c = Arc::clone(container);
        let result = run_bounded(
            &self.clock,
            "request",
            REQUEST_BUDGET_MS,
            container,
            async move { c.handle(req).await },
        )
        .await;

        if matches!(result, Err(GateError::OperationTimeout { .. })) {
            // The overrunning request got the container killed; retire its
            // entry so the domain starts fresh.
            self.active
                .remove_if(domain, |_, entry| Arc::ptr_eq(&entry.container, container));
        }
        result
    }

    /// Whether a domain currently has a live container.
    pub fn is_active(&self, domain: &str) -> bool {
        self.active.contains_key(domain)
    }

    /// Domains with a live container.
    pub fn active_domains(&self) -> Vec<String> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    fn arm_sweep(this: &Arc<Self>) {
        if this.closed.load(Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(this);
        let at = this.clock.now() + SWEEP_INTERVAL_MS;
        let task = this.clock.schedule(
            at,
            Box::new(move || {
                Box::pin(async move {
                    if let Some(nursery) = weak.upgrade() {
                        nursery.sweep_idle();
                        Self::arm_sweep(&nursery);
                    }
                }) as BoxFuture<'static, ()>
            }),
        );
        *this.sweep_task.lock() = Some(task);
    }

    /// One sweep pass: retire every domain whose idle gap strictly exceeds
    /// its keep-warm threshold. Retirements run on their own tasks so one
    /// slow shutdown cannot delay the sweep or other domains.
    fn sweep_idle(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let now = self.clock.now();
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|entry| entry.value().idle_ms(now) > entry.value().route.keep_warm_ms())
            .map(|entry| entry.key().clone())
            .collect();

        for domain in expired {
            // Re-check under the shard lock: an access that landed after the
            // scan wins over the sweep.
            let removed = self
                .active
                .remove_if(&domain, |_, entry| entry.idle_ms(now) > entry.route.keep_warm_ms());
            if let Some((domain, entry)) = removed {
                info!(domain = %domain, idle_ms = entry.idle_ms(now), "shutting down idle container");
                let clock = Arc::clone(&self.clock);
                tokio::spawn(async move {
                    retire(&clock, &domain, &entry.container).await;
                });
            }
        }
    }

    /// Process-wide shutdown: cancel the sweep and retire every active
    /// domain with the same bounded shutdown the sweep uses. Idempotent,
    /// including on an already-empty nursery.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.sweep_task.lock().take() {
            self.clock.unschedule(&task);
        }

        let domains: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        info!(count = domains.len(), "shutting down nursery, retiring all active containers");

        let mut retirements = Vec::new();
        for domain in domains {
            if let Some((domain, entry)) = self.active.remove(&domain) {
                let clock = Arc::clone(&self.clock);
                retirements.push(tokio::spawn(async move {
                    retire(&clock, &domain, &entry.container).await;
                }));
            }
        }
        for retirement in retirements {
            let _ = retirement.await;
        }
    }
}
