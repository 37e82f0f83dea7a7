//! Lifecycle properties of the container nursery, driven on virtual time

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use wakegate::clock::ManualClock;
use wakegate::config::RouteConfig;
use wakegate::container::full_body;
use wakegate::error::GateError;
use wakegate::factory::SchemeRegistry;
use wakegate::nursery::ContainerNursery;

fn nursery_for(
    clock: &Arc<ManualClock>,
    route: &RouteConfig,
    factory: Arc<CountingFactory>,
) -> Arc<ContainerNursery> {
    ContainerNursery::new(
        Arc::new(StaticRouter(Some(route.clone()))),
        clock.clone(),
        factory,
    )
}

#[tokio::test]
async fn concurrent_first_requests_create_one_container() {
    let clock = Arc::new(ManualClock::new());
    let dummy = CrashDummyContainer::new();
    let factory = CountingFactory::fixed(dummy.clone());
    let route = http_route("test.example.com", 300);
    let nursery = nursery_for(&clock, &route, factory.clone());

    let mut requests = Vec::new();
    for _ in 0..8 {
        let nursery = Arc::clone(&nursery);
        let route = route.clone();
        requests.push(tokio::spawn(async move { nursery.acquire(&route).await }));
    }
    for request in requests {
        request.await.expect("join").expect("acquire succeeds");
    }

    assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
    assert!(dummy.started.load(Ordering::SeqCst) >= 1);
    assert!(nursery.is_active("test.example.com"));
    nursery.shutdown().await;
}

#[tokio::test]
async fn idle_container_is_retired_on_first_sweep_past_threshold() {
    let clock = Arc::new(ManualClock::new());
    let dummy = CrashDummyContainer::new();
    let factory = CountingFactory::fixed(dummy.clone());
    let route = http_route("test.example.com", 300);
    let nursery = nursery_for(&clock, &route, factory.clone());

    nursery.acquire(&route).await.expect("acquire");

    // Sweeps through t=300s see an idle gap of at most the threshold, never
    // strictly more.
    clock.advance(300_000).await;
    drain_tasks().await;
    assert_eq!(dummy.shutdowns.load(Ordering::SeqCst), 0);
    assert!(nursery.is_active("test.example.com"));

    // First sweep past the threshold (t=310s) retires the container.
    clock.advance(10_000).await;
    drain_tasks().await;
    assert_eq!(dummy.shutdowns.load(Ordering::SeqCst), 1);
    assert!(!nursery.is_active("test.example.com"));

    nursery.shutdown().await;
}

#[tokio::test]
async fn access_resets_the_idle_timer() {
    let clock = Arc::new(ManualClock::new());
    let dummy = CrashDummyContainer::new();
    let factory = CountingFactory::fixed(dummy.clone());
    let route = http_route("test.example.com", 300);
    let nursery = nursery_for(&clock, &route, factory.clone());

    nursery.acquire(&route).await.expect("acquire at t=0");
    clock.advance(100_000).await;
    nursery.acquire(&route).await.expect("acquire at t=100s");
    clock.advance(200_000).await;
    nursery.acquire(&route).await.expect("acquire at t=300s");
    clock.advance(200_000).await;
    nursery.acquire(&route).await.expect("acquire at t=500s");

    // Through t=790s the gap since the last access stays within 300s.
    clock.advance(290_000).await;
    drain_tasks().await;
    assert_eq!(dummy.shutdowns.load(Ordering::SeqCst), 0);

    // No access after t=500s: the sweep at t=810s sees a 310s gap.
    clock.advance(30_000).await;
    drain_tasks().await;
    assert_eq!(dummy.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(factory.creates.load(Ordering::SeqCst), 1);

    nursery.shutdown().await;
}

#[tokio::test]
async fn hung_start_is_killed_once_the_start_budget_elapses() {
    let clock = Arc::new(ManualClock::new());
    let dummy = CrashDummyContainer::hanging_start();
    let factory = CountingFactory::fixed(dummy.clone());
    let route = http_route("test.example.com", 300);
    let nursery = nursery_for(&clock, &route, factory.clone());

    let request = {
        let nursery = Arc::clone(&nursery);
        let route = route.clone();
        tokio::spawn(async move { nursery.acquire(&route).await })
    };
    drain_tasks().await;
    assert_eq!(dummy.killed.load(Ordering::SeqCst), 0);

    clock.advance(60_000).await;
    // The kill ran on the clock's scheduling context during the advance.
    assert!(dummy.killed.load(Ordering::SeqCst) >= 1);

    let result = request.await.expect("join");
    assert!(matches!(
        result,
        Err(GateError::OperationTimeout { op: "start", .. })
    ));
    assert!(!nursery.is_active("test.example.com"));

    nursery.shutdown().await;
}

#[tokio::test]
async fn hung_request_is_killed_once_the_request_budget_elapses() {
    let clock = Arc::new(ManualClock::new());
    let dummy = CrashDummyContainer::hanging_handle();
    let factory = CountingFactory::fixed(dummy.clone());
    let route = http_route("test.example.com", 300);
    let nursery = nursery_for(&clock, &route, factory.clone());

    let container = nursery.acquire(&route).await.expect("acquire");
    let request = {
        let nursery = Arc::clone(&nursery);
        let req = hyper::Request::builder()
            .uri("/")
            .body(full_body(""))
            .expect("request");
        tokio::spawn(async move {
            nursery
                .forward_request("test.example.com", &container, req)
                .await
        })
    };
    drain_tasks().await;
    assert_eq!(dummy.killed.load(Ordering::SeqCst), 0);

    clock.advance(300_000).await;
    assert!(dummy.killed.load(Ordering::SeqCst) >= 1);

    let result = request.await.expect("join");
    assert!(matches!(
        result,
        Err(GateError::OperationTimeout { op: "request", .. })
    ));
    assert_eq!(dummy.handled.load(Ordering::SeqCst), 1);
    assert!(!nursery.is_active("test.example.com"));

    nursery.shutdown().await;
}

#[tokio::test]
async fn hung_shutdown_is_killed_during_nursery_shutdown() {
    let clock = Arc::new(ManualClock::new());
    let dummy = CrashDummyContainer::hanging_shutdown();
    let factory = CountingFactory::fixed(dummy.clone());
    let route = http_route("test.example.com", 300);
    let nursery = nursery_for(&clock, &route, factory.clone());

    nursery.acquire(&route).await.expect("acquire");

    let shutdown = {
        let nursery = Arc::clone(&nursery);
        tokio::spawn(async move { nursery.shutdown().await })
    };
    drain_tasks().await;
    assert_eq!(dummy.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(dummy.killed.load(Ordering::SeqCst), 0);

    clock.advance(60_000).await;
    assert!(dummy.killed.load(Ordering::SeqCst) >= 1);
    shutdown.await.expect("shutdown completes");
}

#[tokio::test]
async fn hung_shutdown_is_killed_during_sweep_retirement() {
    let clock = Arc::new(ManualClock::new());
    let dummy = CrashDummyContainer::hanging_shutdown();
    let factory = CountingFactory::fixed(dummy.clone());
    let route = http_route("test.example.com", 300);
    let nursery = nursery_for(&clock, &route, factory.clone());

    nursery.acquire(&route).await.expect("acquire");
    clock.advance(310_000).await;
    drain_tasks().await;
    assert_eq!(dummy.shutdowns.load(Ordering::SeqCst), 1);
    assert!(!nursery.is_active("test.example.com"));

    clock.advance(60_000).await;
    assert!(dummy.killed.load(Ordering::SeqCst) >= 1);
    nursery.shutdown().await;
}

#[tokio::test]
async fn failed_start_kills_the_container_and_leaves_no_state() {
    let clock = Arc::new(ManualClock::new());
    let dummy = CrashDummyContainer::failing_start();
    let factory = CountingFactory::fixed(dummy.clone());
    let route = http_route("test.example.com", 300);
    let nursery = nursery_for(&clock, &route, factory.clone());

    let err = nursery.acquire(&route).await.expect_err("start fails");
    assert!(matches!(err, GateError::ReadinessTimeout { .. }));
    assert!(dummy.killed.load(Ordering::SeqCst) >= 1);
    assert!(!nursery.is_active("test.example.com"));

    nursery.shutdown().await;
}

#[tokio::test]
async fn unmatched_host_yields_no_route_and_no_container() {
    let clock = Arc::new(ManualClock::new());
    let factory = CountingFactory::fixed(CrashDummyContainer::new());
    let nursery = ContainerNursery::new(
        Arc::new(StaticRouter(None)),
        clock.clone(),
        factory.clone(),
    );

    let result = nursery
        .get_or_create("unknown.example.com")
        .await
        .expect("no route is not an error");
    assert!(result.is_none());
    assert_eq!(factory.creates.load(Ordering::SeqCst), 0);
    assert!(nursery.active_domains().is_empty());

    nursery.shutdown().await;
}

#[tokio::test]
async fn unknown_scheme_fails_construction_and_leaves_no_state() {
    let clock = Arc::new(ManualClock::new());
    let mut route = http_route("test.example.com", 300);
    route.image = "nonexistent://x".to_string();
    let registry = SchemeRegistry::with_factories(Vec::new());
    let nursery = ContainerNursery::new(
        Arc::new(StaticRouter(Some(route))),
        clock.clone(),
        Arc::new(registry),
    );

    let err = nursery
        .get_or_create("test.example.com")
        .await
        .expect_err("construction fails");
    assert!(err.is_configuration());
    assert!(matches!(err, GateError::UnknownScheme(_)));
    assert!(!nursery.is_active("test.example.com"));
    assert!(nursery.active_domains().is_empty());

    nursery.shutdown().await;
}

#[tokio::test]
async fn retired_containers_are_never_reused() {
    let clock = Arc::new(ManualClock::new());
    let factory = CountingFactory::with_supplier(|| {
        CrashDummyContainer::new() as Arc<dyn wakegate::container::Container>
    });
    let route = http_route("test.example.com", 300);
    let nursery = nursery_for(&clock, &route, factory.clone());

    let first = nursery.acquire(&route).await.expect("first acquire");
    clock.advance(310_000).await;
    drain_tasks().await;
    assert!(!nursery.is_active("test.example.com"));

    let second = nursery.acquire(&route).await.expect("second acquire");
    assert_eq!(factory.creates.load(Ordering::SeqCst), 2);
    assert!(!Arc::ptr_eq(&first, &second));

    nursery.shutdown().await;
}
