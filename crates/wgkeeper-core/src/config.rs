//! Configuration resolution for wgkeeper.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Config file (explicit path, or `~/.config/wgkeeper/config.toml` if present)
//! 3. Environment variables (`WGKEEPER_*`)
//! 4. CLI arguments (applied by the binary, highest priority)

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete wgkeeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub database: DatabaseConfig,
    pub provisioning: ProvisioningConfig,
    pub reconciler: ReconcilerConfig,
}

/// Chat bot settings used by the notification sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Bot API token. Notifications are logged and dropped when unset.
    pub token: Option<String>,
    /// Base URL of the Bot API.
    pub api_url: String,
    /// Timeout for a single notification request (seconds).
    pub request_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: "https://api.telegram.org".to_string(),
            request_timeout_secs: 15,
        }
    }
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite file. Defaults to `~/.wgkeeper/wgkeeper.db`.
    pub path: Option<PathBuf>,
}

/// Remote provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Local directory holding generated client configuration files.
    pub artifact_dir: PathBuf,
    /// WireGuard interface name on the remote hosts.
    pub interface: String,
    /// Remote directory holding the interface config and server keys.
    pub registry_dir: String,
    /// Tunnel network (/24). The server takes `.1`, clients start at `.2`.
    pub tunnel_network: Ipv4Addr,
    /// UDP port the remote interface listens on.
    pub listen_port: u16,
    /// DNS servers written into client configs.
    pub dns: Vec<String>,
    /// `PersistentKeepalive` written into client configs (seconds).
    pub keepalive_secs: u16,
    /// Bound on establishing a remote session (seconds).
    pub connect_timeout_secs: u64,
    /// Bound on the connect phase of server setup (seconds).
    pub setup_timeout_secs: u64,
    /// Bound on a single remote command (seconds).
    pub command_timeout_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("vpn_configs"),
            interface: "wg0".to_string(),
            registry_dir: "/etc/wireguard".to_string(),
            tunnel_network: Ipv4Addr::new(10, 0, 0, 0),
            listen_port: 51820,
            dns: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            keepalive_secs: 25,
            connect_timeout_secs: 30,
            setup_timeout_secs: 30,
            command_timeout_secs: 120,
        }
    }
}

/// Subscription reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Interval between sweeps (seconds).
    pub interval_secs: u64,
    /// Near-expiry window in whole days.
    pub warning_days: i64,
    /// Bounded wait for administrator actions (seconds).
    pub action_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            warning_days: 3,
            action_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Validate the configuration. Returns an error on invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.reconciler.interval_secs == 0 {
            return Err(Error::Config("reconciler.interval_secs must be > 0".into()));
        }
        if self.reconciler.warning_days < 0 {
            return Err(Error::Config("reconciler.warning_days must be >= 0".into()));
        }
        if self.reconciler.action_timeout_secs == 0 {
            return Err(Error::Config(
                "reconciler.action_timeout_secs must be > 0".into(),
            ));
        }
        if self.provisioning.tunnel_network.octets()[3] != 0 {
            return Err(Error::Config(format!(
                "provisioning.tunnel_network must be a /24 network address (got {})",
                self.provisioning.tunnel_network
            )));
        }
        if self.provisioning.interface.is_empty() {
            return Err(Error::Config("provisioning.interface must not be empty".into()));
        }
        if !self.provisioning.registry_dir.starts_with('/') {
            return Err(Error::Config(format!(
                "provisioning.registry_dir must be absolute (got {})",
                self.provisioning.registry_dir
            )));
        }
        if self.provisioning.connect_timeout_secs == 0 || self.provisioning.setup_timeout_secs == 0
        {
            return Err(Error::Config("provisioning timeouts must be > 0".into()));
        }
        if let Some(token) = &self.bot.token
            && token.trim().is_empty()
        {
            return Err(Error::Config("bot.token must not be blank when set".into()));
        }
        Ok(())
    }
}

/// Load configuration with layered resolution.
///
/// An explicit `path` must exist; the default global path is only read when
/// present.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("wgkeeper").join("config.toml"))
}

/// Default database path (`~/.wgkeeper/wgkeeper.db`).
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".wgkeeper").join("wgkeeper.db"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `WGKEEPER_*` overrides. `lookup` abstracts the environment so the
/// mapping can be exercised without touching process state.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("WGKEEPER_BOT_TOKEN") {
        config.bot.token = Some(val);
    }
    if let Some(val) = lookup("WGKEEPER_BOT_API_URL") {
        config.bot.api_url = val;
    }
    if let Some(val) = lookup("WGKEEPER_DB_PATH") {
        config.database.path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("WGKEEPER_ARTIFACT_DIR") {
        config.provisioning.artifact_dir = PathBuf::from(val);
    }
    if let Some(n) = lookup("WGKEEPER_SWEEP_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.reconciler.interval_secs = n;
    }
    if let Some(n) = lookup("WGKEEPER_ACTION_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.reconciler.action_timeout_secs = n;
    }
    if let Some(n) = lookup("WGKEEPER_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.provisioning.connect_timeout_secs = n;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_sweeps_hourly() {
        let config = Config::default();
        assert_eq!(config.reconciler.interval_secs, 3600);
        assert_eq!(config.reconciler.warning_days, 3);
        assert_eq!(config.reconciler.action_timeout_secs, 10);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [provisioning]
            interface = "wg1"

            [reconciler]
            interval_secs = 600
            "#,
        )
        .unwrap();
        assert_eq!(config.provisioning.interface, "wg1");
        assert_eq!(config.provisioning.listen_port, 51820);
        assert_eq!(config.reconciler.interval_secs, 600);
        assert_eq!(config.reconciler.warning_days, 3);
    }

    #[test]
    fn rejects_non_network_address() {
        let mut config = Config::default();
        config.provisioning.tunnel_network = Ipv4Addr::new(10, 0, 0, 7);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = Config::default();
        config.reconciler.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("WGKEEPER_BOT_TOKEN", "123:abc"),
            ("WGKEEPER_SWEEP_INTERVAL_SECS", "120"),
            ("WGKEEPER_ACTION_TIMEOUT_SECS", "not-a-number"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.bot.token.as_deref(), Some("123:abc"));
        assert_eq!(config.reconciler.interval_secs, 120);
        assert_eq!(config.reconciler.action_timeout_secs, 10);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config_file(&dir.path().join("missing.toml"));
        assert!(result.is_err());
    }
}
