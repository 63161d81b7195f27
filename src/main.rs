//! Smart LB Operator
//!
//! Runs the LoadBalancer controller against the current cluster, together
//! with the health and metrics endpoints.
//!
//! ```text
//!  LoadBalancer / LoadBalancerSet watch ──▶ Orchestrator ──▶ Neutron
//!                                               │
//!                                               ├──▶ status, finalizers, sets
//!                                               └──▶ Events
//!  :8081 /healthz /livez /readyz     :8080 /metrics
//! ```

use clap::Parser;
use kube::CustomResourceExt;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smart_lb_operator::controlplane;
use smart_lb_operator::{
    CloudClientFactory, Error, EventPublisher, InMemoryCloud, KubeEventPublisher, KubeStore,
    LoadBalancer, LoadBalancerMetrics, LoadBalancerSet, NoopEventPublisher, ObjectKey,
    OpenStackCloudFactory, Orchestrator, OrchestratorConfig, Result, StaticCloudFactory,
};

/// Name reported on published Events
const CONTROLLER_NAME: &str = "smart-lb-operator";

// =============================================================================
// CLI Arguments
// =============================================================================

/// Smart LB Operator - LoadBalancers on OpenStack networking
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Maximum number of concurrent reconciles
    #[arg(long, env = "WORKERS", default_value = "10")]
    workers: u16,

    /// Deadline of a single OpenStack request in seconds
    #[arg(long, env = "OPENSTACK_TIMEOUT_SECS", default_value = "20")]
    openstack_timeout_secs: u64,

    /// Deadline of a whole reconcile in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value = "120")]
    reconcile_timeout_secs: u64,

    /// Reconcile cloud resources at least this often, in seconds
    #[arg(long, env = "CLOUD_RESYNC_SECS", default_value = "300")]
    cloud_resync_secs: u64,

    /// Pause all reconciles
    #[arg(long, env = "SKIP_RECONCILES")]
    skip_reconciles: bool,

    /// Only reconcile this LoadBalancer (<namespace>/<name>)
    #[arg(long, env = "ONLY_RECONCILE")]
    only_reconcile: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Use an in-memory cloud instead of OpenStack
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Print the CRDs as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn orchestrator_config(&self) -> Result<OrchestratorConfig> {
        let only_reconcile = self
            .only_reconcile
            .as_deref()
            .map(str::parse::<ObjectKey>)
            .transpose()?;
        if self.workers == 0 {
            return Err(Error::Configuration("--workers must be at least 1".to_string()));
        }
        Ok(OrchestratorConfig {
            namespace: self.namespace.clone(),
            workers: self.workers,
            cloud_resync_interval: Duration::from_secs(self.cloud_resync_secs),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            skip_reconciles: self.skip_reconciles,
            only_reconcile,
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print_crds()?;
        return Ok(());
    }

    init_logging(&args);

    let config = args.orchestrator_config()?;
    info!("Starting Smart LB Operator");
    info!("  Version: {}", smart_lb_operator::VERSION);
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("<all>"));
    info!("  Workers: {}", config.workers);
    info!("  Standalone mode: {}", args.standalone);
    if config.skip_reconciles {
        info!("  Reconciles are paused");
    }
    if let Some(only) = &config.only_reconcile {
        info!("  Only reconciling {}", only);
    }

    let registry = Registry::new();
    let metrics = Arc::new(LoadBalancerMetrics::register(&registry)?);

    let client = kube::Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client.clone()));

    let (clouds, events): (Arc<dyn CloudClientFactory>, Arc<dyn EventPublisher>) = if args.standalone {
        info!("Using in-memory cloud");
        let cloud = Arc::new(InMemoryCloud::new());
        (
            Arc::new(StaticCloudFactory::new(cloud.clients())),
            Arc::new(NoopEventPublisher),
        )
    } else {
        (
            Arc::new(OpenStackCloudFactory::new(
                client.clone(),
                Duration::from_secs(args.openstack_timeout_secs),
                metrics.clone(),
            )),
            Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
        )
    };

    let orchestrator = Orchestrator::new(config, store, clouds, events, metrics);

    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    controlplane::run(client, orchestrator, ready, shutdown).await;

    info!("Operator shutdown complete");
    Ok(())
}

fn print_crds() -> Result<()> {
    let documents = [
        serde_yaml::to_string(&LoadBalancer::crd()),
        serde_yaml::to_string(&LoadBalancerSet::crd()),
    ]
    .into_iter()
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::Internal(format!("Failed to render CRDs: {}", e)))?;
    print!("{}", documents.join("---\n"));
    Ok(())
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address {:?}: {}", server, addr, e)))
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    info!("Shutdown signal received");
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready.load(Ordering::SeqCst) => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, registry: Registry) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::header::HeaderValue;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = respond(StatusCode::OK, buffer);
                                    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                        response.headers_mut().insert(CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => {
                                    error!("Failed to encode metrics: {}", e);
                                    respond(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                                }
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
