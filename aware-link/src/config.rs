//! Load config from file and environment.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use aware_core::DeviceIdentity;

use crate::establish::BringupPolicy;

/// Link configuration. File: ~/.config/aware-link/config.toml or /etc/aware-link/config.toml.
/// Env overrides: AWARE_LINK_SERVICE_NAME, AWARE_LINK_PASSPHRASE, AWARE_LINK_DEVICE_NAME,
/// AWARE_LINK_BRINGUP_ATTEMPTS, AWARE_LINK_BRINGUP_INTERVAL_MS, AWARE_LINK_LISTEN_PORT,
/// AWARE_LINK_BIND_ADDR, AWARE_LINK_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Service both roles publish and subscribe to (default "AwareData").
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Shared passphrase handed to network negotiation.
    #[serde(default = "default_passphrase")]
    pub passphrase: String,
    /// Advertised device name; resolved from the host when unset.
    #[serde(default)]
    pub device_name: Option<String>,
    /// Availability polls before a bring-up times out (default 50).
    #[serde(default = "default_bringup_attempts")]
    pub bringup_attempts: u32,
    /// Delay between availability polls in milliseconds (default 100).
    #[serde(default = "default_bringup_interval_ms")]
    pub bringup_interval_ms: u64,
    /// Publisher listen port; 0 picks an ephemeral port per bring-up.
    #[serde(default)]
    pub listen_port: u16,
    /// Address the publisher listens on (default "::").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_service_name() -> String {
    "AwareData".into()
}
fn default_passphrase() -> String {
    "AwareDataPass123".into()
}
fn default_bringup_attempts() -> u32 {
    50
}
fn default_bringup_interval_ms() -> u64 {
    100
}
fn default_bind_addr() -> IpAddr {
    IpAddr::from([0u16; 8])
}
fn default_log_filter() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            passphrase: default_passphrase(),
            device_name: None,
            bringup_attempts: default_bringup_attempts(),
            bringup_interval_ms: default_bringup_interval_ms(),
            listen_port: 0,
            bind_addr: default_bind_addr(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn bringup_policy(&self) -> BringupPolicy {
        BringupPolicy {
            attempts: self.bringup_attempts.max(1),
            interval: Duration::from_millis(self.bringup_interval_ms),
        }
    }
}

/// Advertised identity: configured name, then host name, then hardware model.
pub fn local_identity(config: &Config) -> DeviceIdentity {
    DeviceIdentity::resolve([
        config.device_name.clone(),
        std::env::var("HOSTNAME").ok(),
        read_trimmed("/etc/hostname"),
        read_trimmed("/sys/devices/virtual/dmi/id/product_name"),
    ])
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("AWARE_LINK_SERVICE_NAME").filter(|s| !s.trim().is_empty()) {
        c.service_name = s;
    }
    if let Some(s) = var("AWARE_LINK_PASSPHRASE") {
        c.passphrase = s;
    }
    if let Some(s) = var("AWARE_LINK_DEVICE_NAME") {
        c.device_name = Some(s);
    }
    if let Some(n) = var("AWARE_LINK_BRINGUP_ATTEMPTS").and_then(|s| s.parse::<u32>().ok()) {
        c.bringup_attempts = n;
    }
    if let Some(ms) = var("AWARE_LINK_BRINGUP_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.bringup_interval_ms = ms;
    }
    if let Some(p) = var("AWARE_LINK_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(a) = var("AWARE_LINK_BIND_ADDR").and_then(|s| s.parse::<IpAddr>().ok()) {
        c.bind_addr = a;
    }
    if let Some(s) = var("AWARE_LINK_LOG") {
        c.log_filter = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/aware-link/config.toml"));
    }
    out.push(PathBuf::from("/etc/aware-link/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), "invalid config: {}", e),
                },
                Err(e) => tracing::warn!(path = %p.display(), "unreadable config: {}", e),
            }
        }
    }
    None
}
