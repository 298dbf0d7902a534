//! Binary entry point: CLI parsing, config loading, logging setup, and the
//! loops that wire C1–C9 together over a ZeroMQ transport.

mod ingress;

use anyhow::{Context, Result};
use clap::Parser;
use netsync_core::broadcast::{BroadcastConfig, BroadcastScheduler};
use netsync_core::config::ServerConfig;
use netsync_core::discovery::{AppIdGate, DiscoveryResponder};
use netsync_core::lifecycle::{LifecycleConfig, LifecycleManager};
use netsync_core::publisher::Publisher;
use netsync_core::registry::{IdentityRegistry, RegistryLimits};
use netsync_transport::zmq_transport::ZmqTransport;
use netsync_transport::Transport;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Room synchronization hub server.
#[derive(Parser, Debug)]
#[command(name = "netsync-server")]
#[command(about = "Real-time multiplayer room synchronization hub", long_about = None)]
struct Args {
    /// Path to a TOML config file. Missing file is not an error; only its
    /// absence of overrides is implied.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for rotating log files. Logging to a file is skipped if
    /// unset.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    dealer_port: Option<u16>,
    #[arg(long)]
    pub_port: Option<u16>,
    #[arg(long)]
    server_discovery_port: Option<u16>,
    #[arg(long)]
    server_name: Option<String>,
    #[arg(long)]
    disable_server_discovery: bool,
    /// Comma-separated allow-list of application identifiers.
    #[arg(long, value_delimiter = ',')]
    allowed_app_ids: Option<Vec<String>>,
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => ServerConfig::default(),
    };

    if let Some(v) = args.dealer_port { config.dealer_port = v; }
    if let Some(v) = args.pub_port { config.pub_port = v; }
    if let Some(v) = args.server_discovery_port { config.server_discovery_port = v; }
    if let Some(v) = &args.server_name { config.server_name = v.clone(); }
    if args.disable_server_discovery { config.enable_server_discovery = false; }
    if let Some(v) = &args.allowed_app_ids { config.allowed_app_ids = v.clone(); }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_layer = tracing_subscriber::fmt::layer().with_target(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "netsync-server.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(env_filter).with(console_layer).init();
            None
        }
    }
}

fn bind_error_hint(port: u16) -> String {
    #[cfg(unix)]
    {
        format!(
            "Another process may already be listening on port {port}. \
             Find it with `lsof -i :{port}` and stop it with `kill <PID>`."
        )
    }
    #[cfg(windows)]
    {
        format!(
            "Another process may already be listening on port {port}. \
             Find it with `netstat -ano | findstr :{port}` and stop it with `taskkill /PID <PID> /F`."
        )
    }
}

async fn run_discovery_loop(responder: Arc<DiscoveryResponder>, port: u16, running: Arc<AtomicBool>) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| bind_error_hint(port))?;
    tracing::info!(port, "discovery responder listening");
    let mut buf = [0u8; 512];
    while running.load(Ordering::Relaxed) {
        let recv = tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await;
        let (len, peer) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                tracing::error!(%err, "discovery socket read failed");
                continue;
            }
            Err(_) => continue,
        };
        if let Some(reply) = responder.handle(&buf[..len]) {
            if let Err(err) = socket.send_to(reply.as_bytes(), peer).await {
                tracing::warn!(%err, %peer, "failed to send discovery reply");
            }
        }
    }
    Ok(())
}

async fn run_broadcast_loop(scheduler: Arc<BroadcastScheduler>, tick: Duration, running: Arc<AtomicBool>) {
    let mut interval = tokio::time::interval(tick);
    while running.load(Ordering::Relaxed) {
        interval.tick().await;
        scheduler.tick();
    }
}

async fn run_lifecycle_loop(manager: Arc<LifecycleManager>, config: LifecycleConfig, running: Arc<AtomicBool>) {
    let mut sweep = tokio::time::interval(config.sweep_interval);
    let mut cleanup = tokio::time::interval(config.device_id_cleanup_interval);
    while running.load(Ordering::Relaxed) {
        tokio::select! {
            _ = sweep.tick() => manager.sweep_clients_and_rooms(),
            _ = cleanup.tick() => manager.sweep_expired_device_ids(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(args.log_dir.as_ref());
    tracing::info!(?config.dealer_port, ?config.pub_port, "starting netsync-server");

    let transport = ZmqTransport::new();
    let request_socket = match transport.bind_request(config.dealer_port).await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(%err, "{}", bind_error_hint(config.dealer_port));
            std::process::exit(1);
        }
    };
    let publish_socket = match transport.bind_publish(config.pub_port).await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(%err, "{}", bind_error_hint(config.pub_port));
            std::process::exit(1);
        }
    };

    let registry = Arc::new(IdentityRegistry::new(RegistryLimits {
        device_id_expiry: config.device_id_expiry_duration(),
        delta_ring_size: config.delta_ring_size,
        max_global_vars: config.max_global_vars,
        max_client_vars: config.max_client_vars,
        max_var_name_bytes: config.max_var_name_length,
        max_var_value_bytes: config.max_var_value_length,
    }));
    let publisher = Publisher::spawn(publish_socket, config.pub_queue_maxsize);
    let running = Arc::new(AtomicBool::new(true));

    let mut tasks = Vec::new();

    if config.enable_server_discovery {
        let responder = Arc::new(DiscoveryResponder::new(
            AppIdGate::new(config.allowed_app_ids.clone()),
            config.dealer_port,
            config.pub_port,
            config.server_name.clone(),
        ));
        let port = config.server_discovery_port;
        let running = running.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = run_discovery_loop(responder, port, running).await {
                tracing::error!(%err, "discovery loop exited");
            }
        }));
    }

    let broadcast_scheduler = Arc::new(BroadcastScheduler::new(
        registry.clone(),
        publisher.clone(),
        BroadcastConfig {
            tick: Duration::from_millis(50),
            dirty_threshold: config.dirty_threshold_duration(),
            idle_broadcast_interval: config.idle_broadcast_interval_duration(),
        },
    ));
    {
        let scheduler = broadcast_scheduler.clone();
        let running = running.clone();
        let tick = scheduler.tick_interval();
        tasks.push(tokio::spawn(run_broadcast_loop(scheduler, tick, running)));
    }

    let lifecycle_config = LifecycleConfig {
        sweep_interval: Duration::from_secs(1),
        client_timeout: config.client_timeout_duration(),
        empty_room_expiry: config.empty_room_expiry_duration(),
        device_id_cleanup_interval: config.device_id_cleanup_interval_duration(),
        device_id_expiry: config.device_id_expiry_duration(),
    };
    let lifecycle_manager = Arc::new(LifecycleManager::new(registry.clone(), publisher.clone(), lifecycle_config));
    {
        let manager = lifecycle_manager.clone();
        let running = running.clone();
        tasks.push(tokio::spawn(run_lifecycle_loop(manager, lifecycle_config, running)));
    }

    {
        let registry = registry.clone();
        let publisher = publisher.clone();
        let running = running.clone();
        let flush_interval = config.nv_flush_interval_duration();
        tasks.push(tokio::spawn(ingress::run_nv_flush_loop(registry, publisher, flush_interval, running)));
    }

    {
        let registry = registry.clone();
        let publisher = publisher.clone();
        let running = running.clone();
        let gate = AppIdGate::new(config.allowed_app_ids.clone());
        let nv_monitor_threshold = config.nv_monitor_threshold;
        tasks.push(tokio::spawn(ingress::run_ingress_loop(
            request_socket,
            registry,
            publisher,
            gate,
            nv_monitor_threshold,
            running,
        )));
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    running.store(false, Ordering::Relaxed);
    for task in tasks {
        let _ = task.await;
    }
    publisher.stop();

    Ok(())
}
