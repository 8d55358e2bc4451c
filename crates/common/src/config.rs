//! WgKeeper configuration

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory names below the WireGuard root that never hold a peer
pub const RESERVED_DIRS: [&str; 3] = ["server", "templates", "wg_confs"];

/// Relative path of the server's public key file
pub const SERVER_PUBLIC_KEY_PATH: &str = "server/publickey-server";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Root of the WireGuard config tree (peer directories, wg_confs/, server/)
    pub wireguard_path: PathBuf,

    /// Interface name; selects `wg_confs/<interface>.conf`
    pub interface: String,

    /// Subnet peers are allocated from
    pub subnet: String,

    /// Host offset of the first peer address (.1 belongs to the interface)
    pub host_offset: u32,

    /// Rendezvous endpoint written into client documents
    pub endpoint: String,

    /// ListenPort written into client documents
    pub listen_port: u16,

    /// DNS server for the user-facing document
    pub dns: Option<String>,

    /// Address allocation policy
    pub allocation: AllocationPolicy,

    /// Reload trigger configuration
    pub reload: ReloadConfig,

    /// Telemetry configuration
    pub telemetry: TelemetryConfig,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            wireguard_path: PathBuf::from("/wireguard-config"),
            interface: "wg0".to_string(),
            subnet: "192.0.0.0/24".to_string(),
            host_offset: 2,
            endpoint: "192.168.43.30:51820".to_string(),
            listen_port: 51820,
            dns: Some("8.8.8.8".to_string()),
            allocation: AllocationPolicy::default(),
            reload: ReloadConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// How the next peer address is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationPolicy {
    /// Peer count plus offset, nothing else
    Count,
    /// Count-based candidate, skipping addresses already in the server document
    #[default]
    Verified,
}

/// How the running interface picks up changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    /// Restart the whole container
    #[default]
    Restart,
    /// `wg syncconf` inside the container
    Syncconf,
}

/// Reload trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Container running the WireGuard interface
    pub container: String,

    /// What a lifecycle change requests
    pub mode: ReloadMode,

    /// Bound on each container runtime call
    pub timeout_secs: u64,

    /// Attempts per request before giving up
    pub max_attempts: u32,

    /// Initial retry backoff, doubled per attempt
    pub backoff_ms: u64,

    /// Pending requests kept before new ones are coalesced
    pub queue_depth: usize,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            container: "wireguard".to_string(),
            mode: ReloadMode::default(),
            timeout_secs: 30,
            max_attempts: 3,
            backoff_ms: 500,
            queue_depth: 16,
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Prometheus base URL; telemetry is off when unset
    pub prometheus_url: Option<String>,

    /// Per-query timeout
    pub timeout_secs: u64,

    /// A peer counts as active when its last handshake is this recent
    pub active_window_secs: i64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            prometheus_url: None,
            timeout_secs: 10,
            active_window_secs: 180,
        }
    }
}

impl KeeperConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values that would otherwise fail late
    pub fn validate(&self) -> Result<()> {
        let net = self.subnet()?;
        if self.host_offset < 2 || self.host_offset >= net.size().saturating_sub(1) {
            return Err(Error::InvalidConfig(format!(
                "host offset {} does not fit in {}",
                self.host_offset, self.subnet
            )));
        }
        if self.interface.is_empty() || self.interface.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "invalid interface name {:?}",
                self.interface
            )));
        }
        Ok(())
    }

    /// Parsed peer subnet
    pub fn subnet(&self) -> Result<Ipv4Network> {
        Ok(self.subnet.parse()?)
    }

    /// Server document path, relative to the WireGuard root
    pub fn server_conf_rel(&self) -> String {
        format!("wg_confs/{}.conf", self.interface)
    }

    /// Server document path as seen from inside the container
    pub fn container_conf_path(&self) -> String {
        format!("/config/{}", self.server_conf_rel())
    }
}
