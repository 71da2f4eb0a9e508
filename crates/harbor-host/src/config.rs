use anyhow::{bail, Context};
use clap::Parser;
use harbor_core::Settings;
use harbor_storage::default_settings_path;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:18790";
const DEFAULT_LOG_DIR: &str = ".harbor/logs";

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "harbor-host")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub gateway_url: String,
    #[arg(long, default_value = "")]
    pub token: String,
    #[arg(long, default_value = "")]
    pub bridge_addr: String,
    #[arg(long, default_value = "")]
    pub settings_path: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value_t = 15)]
    pub health_interval: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub gateway_url: Url,
    /// True when a flag or env var chose the URL instead of the settings record.
    pub gateway_url_pinned: bool,
    pub token: String,
    pub bridge_addr: SocketAddr,
    pub settings_path: PathBuf,
    pub log_dir: String,
    pub debug: bool,
    pub health_interval: Duration,
}

/// Settings path comes first: everything else may fall back to the record it points at.
pub fn resolve_settings_path(flag: &str) -> PathBuf {
    if let Some(value) = non_empty(flag).or_else(|| env_value("HARBOR_SETTINGS_PATH")) {
        return PathBuf::from(value);
    }
    default_settings_path().unwrap_or_else(|| PathBuf::from("harbor-settings.json"))
}

/// Flag, then env, then the persisted record.
pub fn load_config(args: &Args, settings: &Settings) -> anyhow::Result<Config> {
    let pinned_url = pinned_gateway_url(&args.gateway_url);
    let gateway_url_pinned = pinned_url.is_some();
    let gateway_url = pinned_url.unwrap_or_else(|| settings.gateway_url());
    let gateway_url = Url::parse(&gateway_url)
        .with_context(|| format!("invalid gateway url: {gateway_url}"))?;
    if !matches!(gateway_url.scheme(), "ws" | "wss") {
        bail!("gateway url must use ws or wss: {gateway_url}");
    }

    let bridge_addr = resolve_bridge_addr(&args.bridge_addr);
    let bridge_addr: SocketAddr = bridge_addr
        .parse()
        .with_context(|| format!("invalid bridge address: {bridge_addr}"))?;
    if !bridge_addr.ip().is_loopback() {
        bail!("bridge address must be loopback: {bridge_addr}");
    }

    Ok(Config {
        gateway_url,
        gateway_url_pinned,
        token: non_empty(&args.token)
            .or_else(|| env_value("HARBOR_GATEWAY_TOKEN"))
            .unwrap_or_default(),
        bridge_addr,
        settings_path: resolve_settings_path(&args.settings_path),
        log_dir: resolve_log_dir(&args.log_dir, settings),
        debug: args.debug || env_true("HARBOR_DEBUG") || settings.debug,
        health_interval: Duration::from_secs(args.health_interval.max(1)),
    })
}

fn pinned_gateway_url(flag: &str) -> Option<String> {
    non_empty(flag).or_else(|| env_value("HARBOR_GATEWAY_URL"))
}

fn resolve_bridge_addr(flag: &str) -> String {
    non_empty(flag)
        .or_else(|| env_value("HARBOR_BRIDGE_ADDR"))
        .unwrap_or_else(|| DEFAULT_BRIDGE_ADDR.to_string())
}

pub fn resolve_log_dir(flag: &str, settings: &Settings) -> String {
    non_empty(flag)
        .or_else(|| env_value("HARBOR_LOG_DIR"))
        .or_else(|| non_empty(&settings.log_dir))
        .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| non_empty(&value))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
