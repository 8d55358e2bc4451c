//! Server Commands

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::Path;
use wgkeeper_common::{KeeperConfig, ServerInfo};

use super::App;
use crate::output::{print_error, print_item, print_success, print_warning, OutputFormat, TableDisplay};

/// Server info display wrapper
#[derive(Serialize)]
pub struct ServerInfoDisplay {
    #[serde(flatten)]
    pub info: ServerInfo,
}

impl TableDisplay for ServerInfoDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "Key File", "Server Config", "Peers", "Path"]
    }

    fn row(&self) -> Vec<String> {
        let present = |b: bool| if b { "present" } else { "missing" }.to_string();
        vec![
            self.info.server_public_key.clone(),
            present(self.info.public_key_present),
            present(self.info.server_conf_present),
            self.info.peer_count.to_string(),
            self.info.wireguard_path.clone(),
        ]
    }
}

pub async fn info(app: &App, format: OutputFormat) -> Result<()> {
    let info = app.manager.server_info().await?;
    let orphans = info.orphaned_sections.clone();
    print_item(&ServerInfoDisplay { info }, format);

    if !orphans.is_empty() && format != OutputFormat::Json {
        print_warning(&format!(
            "Server config has sections without a peer directory: {}",
            orphans.join(", ")
        ));
    }
    Ok(())
}

pub async fn reload(app: &App) -> Result<()> {
    let outcome = app.manager.reload_now().await;
    if outcome.success {
        print_success(&outcome.message);
        Ok(())
    } else {
        print_error(&outcome.message);
        bail!("reload failed")
    }
}

/// Write a default config file
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    KeeperConfig::default().save(path)?;
    print_success(&format!("Wrote default config to {}", path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_config_refuses_overwrite() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        init_config(&path, false).unwrap();
        let loaded = KeeperConfig::load(&path).unwrap();
        assert_eq!(loaded.interface, "wg0");

        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();
    }
}
