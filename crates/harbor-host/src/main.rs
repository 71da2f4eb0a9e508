use anyhow::Context;
use clap::Parser;
use harbor_core::{ResolvedTheme, Settings};
use harbor_host::config::{env_true, load_config, resolve_log_dir, resolve_settings_path, Args};
use harbor_host::gateway::{run_link, GatewayHandle, GatewayLinkConfig};
use harbor_host::logging::init_logging;
use harbor_host::native::{LogIndicator, NativeServices};
use harbor_host::periodic::spawn_periodic;
use harbor_host::settings::SettingsService;
use harbor_host::surface::{self, BridgeServer};
use harbor_host::{Coordinator, HostEvent, HostOptions};
use harbor_storage::{GeometryStore, SettingsStore, StorageError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let store = SettingsStore::new(resolve_settings_path(&args.settings_path));
    let loaded = store.load();
    let settings = match &loaded {
        Ok(settings) => settings.clone(),
        Err(_) => Settings::default(),
    };

    let debug_enabled = args.debug || env_true("HARBOR_DEBUG") || settings.debug;
    let _log_guard = init_logging(&resolve_log_dir(&args.log_dir, &settings), debug_enabled);
    match loaded {
        Ok(_) => debug!(event = "settings_loaded", path = %store.path().display()),
        Err(StorageError::Missing { path }) => {
            info!(event = "settings_missing", path = %path.display())
        }
        Err(err) => warn!(event = "persistence_error", error = %err),
    }

    let config = load_config(&args, &settings)?;
    info!(
        event = "host_start",
        gateway = %config.gateway_url,
        bridge = %config.bridge_addr,
        settings = %config.settings_path.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let geometry = GeometryStore::beside(&store);
    let (settings_service, settings_writer) = SettingsService::spawn(store, settings);
    let (gateway, gateway_commands) = GatewayHandle::channel();

    let mut coordinator = Coordinator::new(
        HostOptions {
            gateway_url: config
                .gateway_url_pinned
                .then(|| config.gateway_url.to_string()),
            token: config.token.clone(),
        },
        settings_service,
        NativeServices::headless(ResolvedTheme::Light),
        gateway.clone(),
        events_tx.clone(),
    )
    .with_geometry(geometry);
    coordinator.add_indicator(Box::new(LogIndicator::new("tray")));
    coordinator.add_indicator(Box::new(LogIndicator::new("titlebar")));
    let coordinator_task = tokio::spawn(coordinator.run(events_rx));

    let link = tokio::spawn(run_link(
        GatewayLinkConfig::new(config.gateway_url.clone(), config.token.clone()),
        events_tx.clone(),
        gateway_commands,
        shutdown_rx.clone(),
    ));

    let health_gateway = gateway.clone();
    let health = spawn_periodic(
        "gateway_health",
        config.health_interval,
        shutdown_rx.clone(),
        move || {
            let gateway = health_gateway.clone();
            async move {
                if let Err(err) = gateway.health_check().await {
                    debug!(event = "gateway_health_check_failed", error = %err);
                }
            }
        },
    );

    let listener = TcpListener::bind(config.bridge_addr)
        .await
        .with_context(|| format!("bind bridge on {}", config.bridge_addr))?;
    let server = tokio::spawn(surface::serve(
        listener,
        BridgeServer::new(events_tx.clone()),
        shutdown_rx.clone(),
    ));
    info!(event = "bridge_listening", addr = %config.bridge_addr);

    let _ = tokio::signal::ctrl_c().await;
    info!(event = "host_shutdown");

    let _ = events_tx.send(HostEvent::Shutdown).await;
    let _ = coordinator_task.await;
    let _ = shutdown_tx.send(true);
    let _ = link.await;
    let _ = health.await;
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Err(err))) => warn!(event = "bridge_error", error = %err),
        Ok(_) => {}
        Err(_) => debug!(event = "bridge_shutdown_timeout"),
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, settings_writer).await;
    Ok(())
}
