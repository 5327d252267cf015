//! CLI-owned configuration: a TOML file merged with `GOVEE_*`
//! environment variables and command-line flags.
//!
//! Core never sees these types -- it receives a pre-built
//! `ControllerConfig`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use govee_lan_core::{ControllerConfig, config as core_config};

use crate::cli::GlobalOpts;
use crate::error::CliError;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: Network,

    #[serde(default)]
    pub discovery: Discovery,

    /// Named aliases mapping a friendly name to a device id or IP.
    #[serde(default)]
    pub devices: HashMap<String, String>,
}

/// Endpoint addressing. Defaults mirror the protocol constants.
#[derive(Debug, Deserialize, Serialize)]
pub struct Network {
    pub broadcast_address: IpAddr,
    pub broadcast_port: u16,
    pub listening_address: IpAddr,
    pub listening_port: u16,
    pub command_port: u16,
}

impl Default for Network {
    fn default() -> Self {
        let defaults = ControllerConfig::default();
        Self {
            broadcast_address: defaults.broadcast_address,
            broadcast_port: defaults.broadcast_port,
            listening_address: defaults.listening_address,
            listening_port: defaults.listening_port,
            command_port: defaults.command_port,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Discovery {
    /// Seconds to wait for scan answers before a command gives up.
    pub wait_secs: u64,

    /// Addresses to scan by unicast on every invocation.
    #[serde(default)]
    pub manual_addresses: Vec<IpAddr>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            wait_secs: 3,
            manual_addresses: Vec::new(),
        }
    }
}

impl Config {
    /// Translate into a one-shot controller configuration. Discovery
    /// runs on a long interval so exactly one scan round fires at
    /// startup; polling and eviction stay off for a short-lived
    /// process.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            broadcast_address: self.network.broadcast_address,
            broadcast_port: self.network.broadcast_port,
            listening_address: self.network.listening_address,
            listening_port: self.network.listening_port,
            command_port: self.network.command_port,
            discovery_enabled: true,
            discovery_interval: core_config::DISCOVERY_INTERVAL,
            evict_enabled: false,
            update_enabled: false,
            ..ControllerConfig::default()
        }
    }

    /// How long to wait for a device to answer, CLI flag first.
    pub fn wait(&self, global: &GlobalOpts) -> Duration {
        Duration::from_secs(global.wait.unwrap_or(self.discovery.wait_secs))
    }

    /// Resolve a configured alias to its device id or address.
    pub fn resolve_alias(&self, name: &str) -> Option<&str> {
        self.devices.get(name).map(String::as_str)
    }
}

pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "hyperbliss", "govee")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("govee.toml"))
}

/// Defaults, overlaid with the TOML file (if present), overlaid with
/// `GOVEE_*` environment variables.
pub fn load() -> Result<Config, CliError> {
    let config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file(config_path()))
        .merge(Env::prefixed("GOVEE_").split("__"))
        .extract()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_mirror_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.network.broadcast_port, 4001);
        assert_eq!(config.network.listening_port, 4002);
        assert_eq!(config.network.command_port, 4003);
        assert_eq!(
            config.network.broadcast_address.to_string(),
            "239.255.255.250"
        );
    }

    #[test]
    fn controller_config_is_one_shot() {
        let controller = Config::default().controller_config();
        assert!(controller.discovery_enabled);
        assert!(!controller.update_enabled);
        assert!(!controller.evict_enabled);
    }

    #[test]
    fn alias_resolution() {
        let mut config = Config::default();
        config
            .devices
            .insert("desk".into(), "1F:80:C5:32:32:36:72:4E".into());
        assert_eq!(config.resolve_alias("desk"), Some("1F:80:C5:32:32:36:72:4E"));
        assert_eq!(config.resolve_alias("sofa"), None);
    }
}
