use clap::Parser;
use envgate::api::ApiState;
use envgate::cluster::ClusterRunner;
use envgate::config::{Config, ConfigOptions};
use envgate::local::LocalRunner;
use envgate::metrics::MemoryMetricStore;
use envgate::proxy::ProxyServer;
use envgate::purge::{self, PurgeController};
use envgate::registry::{
    proxy_control_channel, ProxyControl, ProxyControlReceiver, ProxyControlSender, ProxyRegistry,
};
use envgate::runner::{TaskRunner, STATUS_RUNNING};
use envgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Interval at which running tasks are re-announced to the registry so
/// their handler deadlines keep getting extended.
const SYNC_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = PKG_NAME, version = VERSION, about = "On-demand per-branch environment gateway")]
struct Cli {
    /// Path or https:// URL of the configuration file
    #[arg(long, env = "ENVGATE_CONF")]
    conf: Option<String>,

    /// Domain suffix routed by the gateway
    #[arg(long, env = "ENVGATE_DOMAIN", default_value = "localtest.me")]
    domain: String,

    /// Run workloads as local child processes instead of cluster tasks
    #[arg(long, env = "ENVGATE_LOCAL")]
    local: bool,

    /// Default listen/target port when the config declares none
    #[arg(long, default_value_t = 80)]
    default_port: u16,

    /// Accept v1 clients: any POST content type, encoded SUBDOMAIN env
    #[arg(long)]
    compat_v1: bool,

    /// Log format: text or json
    #[arg(long, env = "ENVGATE_LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// Log level directive (e.g. info, debug, envgate=debug)
    #[arg(long, env = "ENVGATE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_format, &cli.log_level)?;

    let opts = ConfigOptions {
        path: cli.conf.clone(),
        domain: cli.domain.clone(),
        local_mode: cli.local,
        default_port: cli.default_port,
        compat_v1: cli.compat_v1,
    };
    let cfg = Arc::new(Config::load(&opts).await.map_err(|e| {
        error!(error = %e, "failed to load configuration");
        anyhow::anyhow!("{e}")
    })?);

    info!(name = PKG_NAME, version = VERSION, "starting gateway");
    info!(
        web_api = %cfg.host.web_api,
        suffix = %cfg.host.reverse_proxy_suffix,
        listeners = cfg.listen.http.len(),
        local_mode = cfg.local_mode,
        compat_v1 = cfg.compat_v1,
        "gateway configuration"
    );

    let metrics = Arc::new(MemoryMetricStore::new());
    let runner: Arc<dyn TaskRunner> = if cfg.local_mode {
        Arc::new(LocalRunner::new(Arc::clone(&cfg), metrics))
    } else {
        Arc::new(ClusterRunner::new(Arc::clone(&cfg), metrics).await?)
    };

    let (control_tx, control_rx) = proxy_control_channel();
    runner.set_proxy_control_channel(control_tx.clone());

    let registry = Arc::new(ProxyRegistry::new(Arc::clone(&cfg)));
    let purge_controller = Arc::new(PurgeController::new(Arc::clone(&runner)));
    let api = Arc::new(ApiState::new(
        Arc::clone(&cfg),
        Arc::clone(&runner),
        Arc::clone(&purge_controller),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(control_loop(
        Arc::clone(&registry),
        control_rx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(sync_loop(
        Arc::clone(&runner),
        control_tx.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(publish_loop(
        Arc::clone(&registry),
        Arc::clone(&runner),
        shutdown_rx.clone(),
    ));
    if let Some(purge_cfg) = cfg.purge.clone() {
        info!(schedule = %purge_cfg.schedule, "scheduled purge enabled");
        tokio::spawn(purge::run_schedule(
            Arc::clone(&purge_controller),
            purge_cfg,
            shutdown_rx.clone(),
        ));
    }

    let mut server_handles = Vec::new();
    for pm in &cfg.listen.http {
        let addr: SocketAddr = format!("{}:{}", cfg.listen.foreign_address, pm.listen)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address: {e}"))?;
        let server = ProxyServer::new(
            addr,
            pm.listen,
            Arc::clone(&cfg),
            Arc::clone(&registry),
            Arc::clone(&api),
            shutdown_rx.clone(),
        );
        server_handles.push(tokio::spawn(async move {
            if let Err(err) = server.run().await {
                error!(error = %err, "proxy server error");
            }
        }));
    }

    wait_for_shutdown().await;
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in server_handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

fn init_logging(format: &str, level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    match format {
        "text" | "" => tracing_subscriber::fmt().with_env_filter(filter).init(),
        "json" => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        other => anyhow::bail!("invalid log format (text or json): {other}"),
    }
    Ok(())
}

/// Single consumer of the proxy control channel; the only place the
/// registry is mutated from runner events.
async fn control_loop(
    registry: Arc<ProxyRegistry>,
    mut rx: ProxyControlReceiver,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(action) => registry.modify(action),
                    None => break,
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Re-announce running tasks so the registry tracks cluster state and
/// handler deadlines stay extended while tasks live.
async fn sync_loop(
    runner: Arc<dyn TaskRunner>,
    control_tx: ProxyControlSender,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SYNC_INTERVAL) => {
                match runner.list(STATUS_RUNNING).await {
                    Ok(infos) => {
                        for info in infos {
                            if info.subdomain.is_empty() || info.ip_address.is_empty() {
                                continue;
                            }
                            for port in info.port_map.values() {
                                let _ = control_tx.send(ProxyControl::Add {
                                    subdomain: info.subdomain.clone(),
                                    ip_address: info.ip_address.clone(),
                                    port: *port,
                                });
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to sync running tasks"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Publish collected access counters once per counter unit.
async fn publish_loop(
    registry: Arc<ProxyRegistry>,
    runner: Arc<dyn TaskRunner>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = registry.counter_unit();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let counts = registry.collect_access_counts();
                if counts.is_empty() {
                    continue;
                }
                if let Err(err) = runner.put_access_counts(counts).await {
                    warn!(error = %err, "failed to publish access counts");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    tokio::signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
    info!("received Ctrl+C, shutting down");
}
