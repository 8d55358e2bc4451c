//! Peer Commands

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;
use wgkeeper_common::{CreatedPeer, PeerStats, PeerSummary};

use super::App;
use crate::output::{
    format_bytes, print_item, print_list, print_message, print_success, print_warning,
    OutputFormat, TableDisplay,
};

#[derive(Subcommand)]
pub enum PeerCommands {
    /// Create a peer and register it with the server
    Add {
        /// Peer name (lowercased, only letters, digits, `-` and `_` are kept)
        name: String,
    },

    /// Delete a peer and all of its files
    Remove {
        /// Peer name
        name: String,
    },

    /// List peers
    List {
        /// Include traffic and handshake data from Prometheus
        #[arg(long)]
        metrics: bool,
    },

    /// Print the importable config of a peer
    Show {
        /// Peer name
        name: String,

        /// Also print traffic and handshake data
        #[arg(long)]
        metrics: bool,
    },
}

/// Created peer display wrapper
#[derive(Serialize)]
pub struct CreatedDisplay {
    pub name: String,
    pub address: String,
    pub public_key: String,
    pub config_file: String,
}

impl From<&CreatedPeer> for CreatedDisplay {
    fn from(peer: &CreatedPeer) -> Self {
        Self {
            name: peer.name.to_string(),
            address: peer.address.to_string(),
            public_key: peer.public_key.clone(),
            config_file: peer.config_file.clone(),
        }
    }
}

impl TableDisplay for CreatedDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Address", "Public Key", "Config"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.address.clone(),
            self.public_key.clone(),
            self.config_file.clone(),
        ]
    }
}

/// Peer listing display wrapper
#[derive(Serialize)]
pub struct PeerDisplay {
    pub name: String,
    pub address: String,
    pub public_key: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PeerStats>,
}

impl From<PeerSummary> for PeerDisplay {
    fn from(peer: PeerSummary) -> Self {
        let status = if peer.orphaned {
            "orphaned"
        } else {
            match &peer.metrics {
                Some(m) if m.is_active => "active",
                Some(_) => "idle",
                None => "configured",
            }
        };
        Self {
            name: peer.name.to_string(),
            address: peer
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            public_key: peer.public_key.unwrap_or_else(|| "-".to_string()),
            status: status.to_string(),
            metrics: peer.metrics,
        }
    }
}

impl TableDisplay for PeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Address", "Public Key", "Status", "Sent", "Received", "Handshake"]
    }

    fn row(&self) -> Vec<String> {
        let (sent, received, handshake) = match &self.metrics {
            Some(m) => (
                format_bytes(m.sent_bytes),
                format_bytes(m.received_bytes),
                m.time_since_handshake
                    .as_ref()
                    .map(|t| format!("{} ago", t))
                    .unwrap_or_else(|| "never".to_string()),
            ),
            None => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        vec![
            self.name.clone(),
            self.address.clone(),
            self.public_key.clone(),
            self.status.clone(),
            sent,
            received,
            handshake,
        ]
    }
}

/// Per-peer metrics display wrapper
#[derive(Serialize)]
pub struct StatsDisplay {
    pub name: String,
    #[serde(flatten)]
    pub stats: PeerStats,
}

impl TableDisplay for StatsDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Sent", "Received", "Total", "Last Handshake", "Active"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            format_bytes(self.stats.sent_bytes),
            format_bytes(self.stats.received_bytes),
            format_bytes(self.stats.total_bytes),
            self.stats
                .last_handshake
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string()),
            self.stats.is_active.to_string(),
        ]
    }
}

fn print_show_metrics(
    name: String,
    stats: Option<PeerStats>,
    error: Option<String>,
    format: OutputFormat,
) {
    match (stats, error) {
        (_, Some(error)) => print_warning(&format!("Metrics unavailable: {}", error)),
        (Some(stats), None) => print_item(&StatsDisplay { name, stats }, format),
        (None, None) => println!("{}", "No metrics recorded for this peer".dimmed()),
    }
}

pub async fn execute(cmd: PeerCommands, app: &App, format: OutputFormat) -> Result<()> {
    let manager = &app.manager;
    match cmd {
        PeerCommands::Add { name } => {
            let created = manager.create(&name).await?;
            if format != OutputFormat::Json {
                print_success(&format!("Peer '{}' created at {}", created.name, created.address));
            }
            if created.server_key_pending {
                print_warning("Server public key is missing; the peer config carries a placeholder");
            }
            print_item(&CreatedDisplay::from(&created), format);
        }

        PeerCommands::Remove { name } => {
            let name = manager.delete(&name).await?;
            match format {
                OutputFormat::Json => print_message(&format!("Peer '{}' deleted", name), format),
                _ => print_success(&format!("Peer '{}' deleted", name)),
            }
        }

        PeerCommands::List { metrics } => {
            let peers: Vec<PeerDisplay> = manager
                .list(metrics)
                .await?
                .into_iter()
                .map(PeerDisplay::from)
                .collect();
            print_list(&peers, format);
        }

        PeerCommands::Show { name, metrics } => {
            let view = manager.show(&name, metrics).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
                _ => {
                    print!("{}", view.config);
                    if metrics {
                        println!();
                        print_show_metrics(view.name.to_string(), view.metrics, view.metrics_error, format);
                    }
                }
            }
        }
    }

    Ok(())
}
