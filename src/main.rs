use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::clock::{Clock, SystemClock};
use wakegate::config::{Config, RouteType};
use wakegate::docker::{DockerContainerFactory, DockerManager};
use wakegate::factory::SchemeRegistry;
use wakegate::nursery::ContainerNursery;
use wakegate::pool::{ConnectionPool, PoolConfig};
use wakegate::proxy::HttpProxy;
use wakegate::relay::{TcpRelay, UdpRelay};
use wakegate::router::ConfigRouter;
use wakegate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Construct the serving dependencies explicitly; nothing here is a
    // process-wide global.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let docker = DockerManager::new(config.server.docker_host.clone());
    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    }));

    let registry = SchemeRegistry::with_factories(vec![Arc::new(DockerContainerFactory::new(
        docker,
        Arc::clone(&clock),
        Arc::clone(&pool),
    ))]);
    info!(schemes = ?registry.schemes(), "Container factories registered");

    let router = Arc::new(ConfigRouter::new(&config));
    let nursery = ContainerNursery::new(router, Arc::clone(&clock), Arc::new(registry));

    // HTTP listener, shared by every HTTP route
    let http_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid HTTP bind address");
            anyhow::anyhow!("Invalid HTTP bind address: {}", e)
        })?;

    let http_proxy = HttpProxy::bind(http_addr, Arc::clone(&nursery), shutdown_rx.clone()).await?;
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_proxy.run().await {
            error!(error = %e, "HTTP proxy error");
        }
    });

    // One dedicated relay per TCP/UDP route
    let mut relay_handles = Vec::new();
    for route in &config.routes {
        match route.route_type {
            RouteType::Http => {}
            RouteType::Tcp => {
                let relay = TcpRelay::new(
                    route.clone(),
                    config.server.bind.clone(),
                    Arc::clone(&nursery),
                    shutdown_rx.clone(),
                );
                let domain = route.domain.clone();
                relay_handles.push(tokio::spawn(async move {
                    if let Err(e) = relay.run().await {
                        error!(domain = %domain, error = %e, "TCP relay error");
                    }
                }));
            }
            RouteType::Udp => {
                let relay = UdpRelay::new(
                    route.clone(),
                    config.server.bind.clone(),
                    Arc::clone(&nursery),
                    shutdown_rx.clone(),
                );
                let domain = route.domain.clone();
                relay_handles.push(tokio::spawn(async move {
                    if let Err(e) = relay.run().await {
                        error!(domain = %domain, error = %e, "UDP relay error");
                    }
                }));
            }
        }
    }

    // Wait for shutdown signal
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal listeners, then retire every active container before exit so
    // none is abandoned running.
    let _ = shutdown_tx.send(true);
    nursery.shutdown().await;

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = http_handle.await;
        for handle in relay_handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting activation proxy");
    info!(
        bind = %config.server.bind,
        http_port = config.server.port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        route_count = config.routes.len(),
        routes = ?config
            .routes
            .iter()
            .map(|r| r.domain.as_str())
            .collect::<Vec<_>>(),
        "Configured routes"
    );
}
