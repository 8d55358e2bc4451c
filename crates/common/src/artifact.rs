//! Peer-side artifacts
//!
//! For every peer two importable documents are produced: `<name>/peer.conf`
//! next to the raw key files, and a flat `<name>.conf` meant for handing to the
//! user (same content plus a DNS line).

use crate::keys::{KeyPair, PresharedKey};
use crate::registry::PeerName;
use crate::store::PeerStore;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

/// Stand-in for the server key when `server/publickey-server` is missing
pub const SERVER_PUBLIC_KEY_PLACEHOLDER: &str = "SERVER_PUBLIC_KEY_PLACEHOLDER";

// ============================================================================
// Server identity
// ============================================================================

/// Reads the server's public key from a well-known file
#[derive(Clone)]
pub struct ServerIdentity {
    store: Arc<dyn PeerStore>,
    path: String,
}

impl ServerIdentity {
    pub fn new(store: Arc<dyn PeerStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    /// Whether the key file is present
    pub async fn is_available(&self) -> bool {
        matches!(self.store.exists(&self.path).await, Ok(true))
    }

    /// Server public key, or [`SERVER_PUBLIC_KEY_PLACEHOLDER`]
    pub async fn public_key(&self) -> String {
        match self.store.read(&self.path).await {
            Ok(Some(key)) if !key.trim().is_empty() => key.trim().to_string(),
            Ok(_) => SERVER_PUBLIC_KEY_PLACEHOLDER.to_string(),
            Err(e) => {
                warn!("Could not read {}: {}", self.path, e);
                SERVER_PUBLIC_KEY_PLACEHOLDER.to_string()
            }
        }
    }

    pub fn is_placeholder(key: &str) -> bool {
        key == SERVER_PUBLIC_KEY_PLACEHOLDER
    }
}

// ============================================================================
// Client document
// ============================================================================

/// Combined importable document for one peer
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: Ipv4Addr,
    pub private_key: String,
    pub listen_port: u16,
    pub dns: Option<String>,
    pub server_public_key: String,
    pub preshared_key: String,
    pub endpoint: String,
}

impl ClientConfig {
    pub fn render(&self) -> String {
        let dns_line = self
            .dns
            .as_ref()
            .map(|d| format!("DNS = {}\n", d))
            .unwrap_or_default();

        format!(
r#"[Interface]
Address = {address}
PrivateKey = {private_key}
ListenPort = {listen_port}
{dns_line}
[Peer]
PublicKey = {server_public_key}
PresharedKey = {preshared_key}
Endpoint = {endpoint}
AllowedIPs = 0.0.0.0/0
"#,
            address = self.address,
            private_key = self.private_key,
            listen_port = self.listen_port,
            dns_line = dns_line,
            server_public_key = self.server_public_key,
            preshared_key = self.preshared_key,
            endpoint = self.endpoint,
        )
    }
}

/// The few fields callers read back out of a client document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfigFields {
    pub address: Option<Ipv4Addr>,
    pub server_public_key: Option<String>,
}

/// Pull `Address` from `[Interface]` and `PublicKey` from `[Peer]`
pub fn parse_client_config(text: &str) -> ClientConfigFields {
    let mut fields = ClientConfigFields::default();
    let mut section = String::new();

    for line in text.lines() {
        let t = line.trim();
        if t.starts_with('[') && t.ends_with(']') {
            section = t.to_ascii_lowercase();
            continue;
        }
        let Some((key, value)) = t.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match (section.as_str(), key) {
            ("[interface]", "Address") if fields.address.is_none() => {
                // Address may carry a prefix length
                let host = value.split('/').next().unwrap_or(value);
                fields.address = host.trim().parse().ok();
            }
            ("[peer]", "PublicKey") if fields.server_public_key.is_none() => {
                fields.server_public_key = Some(value.to_string());
            }
            _ => {}
        }
    }
    fields
}

// ============================================================================
// Builder
// ============================================================================

/// Everything the builder needs to know about a freshly created peer
#[derive(Debug, Clone)]
pub struct PeerArtifactSpec<'a> {
    pub name: &'a PeerName,
    pub address: Ipv4Addr,
    pub keys: &'a KeyPair,
    pub preshared_key: &'a PresharedKey,
}

/// Paths written for one peer, relative to the store root
#[derive(Debug, Clone)]
pub struct PeerArtifacts {
    pub directory: String,
    pub config_file: String,
    pub server_public_key: String,
}

/// Writes and removes peer-side files
#[derive(Clone)]
pub struct ArtifactBuilder {
    store: Arc<dyn PeerStore>,
    identity: ServerIdentity,
    endpoint: String,
    listen_port: u16,
    dns: Option<String>,
}

impl ArtifactBuilder {
    pub fn new(
        store: Arc<dyn PeerStore>,
        identity: ServerIdentity,
        endpoint: impl Into<String>,
        listen_port: u16,
        dns: Option<String>,
    ) -> Self {
        Self {
            store,
            identity,
            endpoint: endpoint.into(),
            listen_port,
            dns,
        }
    }

    /// Write key files and both documents. Existing files are overwritten.
    pub async fn build(&self, spec: &PeerArtifactSpec<'_>) -> Result<PeerArtifacts> {
        let name = spec.name;
        let dir = name.dir();
        let server_public_key = self.identity.public_key().await;
        if ServerIdentity::is_placeholder(&server_public_key) {
            warn!("Server public key not available yet; {} gets a placeholder", name);
        }

        self.store
            .write(&format!("{}/privatekey-{}", dir, name), &spec.keys.private_key)
            .await?;
        self.store
            .write(&format!("{}/publickey-{}", dir, name), &spec.keys.public_key)
            .await?;
        self.store
            .write(
                &format!("{}/presharedkey-{}", dir, name),
                spec.preshared_key.as_str(),
            )
            .await?;

        let mut client = ClientConfig {
            address: spec.address,
            private_key: spec.keys.private_key.clone(),
            listen_port: self.listen_port,
            dns: None,
            server_public_key: server_public_key.clone(),
            preshared_key: spec.preshared_key.as_str().to_string(),
            endpoint: self.endpoint.clone(),
        };
        self.store
            .write(&format!("{}/peer.conf", dir), &client.render())
            .await?;

        client.dns = self.dns.clone();
        let config_file = name.flat_conf();
        self.store.write(&config_file, &client.render()).await?;

        info!("Wrote artifacts for {} ({})", name, spec.address);
        Ok(PeerArtifacts {
            directory: dir,
            config_file,
            server_public_key,
        })
    }

    /// Delete the peer directory and the flat document. Returns whether anything existed.
    pub async fn remove(&self, name: &PeerName) -> Result<bool> {
        let dir_existed = self.store.remove(&name.dir()).await?;
        let conf_existed = self.store.remove(&name.flat_conf()).await?;
        Ok(dir_existed || conf_existed)
    }

    /// The flat user-facing document
    pub async fn read_flat(&self, name: &PeerName) -> Result<String> {
        self.store
            .read(&name.flat_conf())
            .await?
            .ok_or_else(|| Error::not_found("peer config", name.flat_conf()))
    }

    /// Address recorded in `<name>/peer.conf`
    pub async fn recorded_address(&self, name: &PeerName) -> Result<Option<Ipv4Addr>> {
        let path = format!("{}/peer.conf", name.dir());
        Ok(self
            .store
            .read(&path)
            .await?
            .and_then(|text| parse_client_config(&text).address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_keypair, generate_preshared_key};
    use crate::registry::sanitize;
    use crate::store::MemoryStore;

    fn builder(store: Arc<MemoryStore>) -> ArtifactBuilder {
        let identity = ServerIdentity::new(store.clone(), "server/publickey-server");
        ArtifactBuilder::new(
            store,
            identity,
            "vpn.example.net:51820",
            51820,
            Some("8.8.8.8".to_string()),
        )
    }

    #[tokio::test]
    async fn test_placeholder_when_server_key_missing() {
        let store = Arc::new(MemoryStore::new());
        let identity = ServerIdentity::new(store.clone(), "server/publickey-server");
        assert!(!identity.is_available().await);
        assert_eq!(identity.public_key().await, SERVER_PUBLIC_KEY_PLACEHOLDER);

        store.write("server/publickey-server", "SERVERKEY\n").await.unwrap();
        assert!(identity.is_available().await);
        assert_eq!(identity.public_key().await, "SERVERKEY");
    }

    #[test]
    fn test_render_and_parse() {
        let client = ClientConfig {
            address: Ipv4Addr::new(192, 0, 0, 5),
            private_key: "PRIV".to_string(),
            listen_port: 51820,
            dns: Some("1.1.1.1".to_string()),
            server_public_key: "SRV".to_string(),
            preshared_key: "PSK".to_string(),
            endpoint: "host:51820".to_string(),
        };
        let text = client.render();
        assert!(text.contains("ListenPort = 51820\nDNS = 1.1.1.1\n\n[Peer]"));
        assert!(text.contains("AllowedIPs = 0.0.0.0/0\n"));

        let fields = parse_client_config(&text);
        assert_eq!(fields.address, Some(Ipv4Addr::new(192, 0, 0, 5)));
        assert_eq!(fields.server_public_key.as_deref(), Some("SRV"));
    }

    #[test]
    fn test_parse_address_with_prefix() {
        let fields = parse_client_config("[Interface]\nAddress = 10.0.0.9/32\n");
        assert_eq!(fields.address, Some(Ipv4Addr::new(10, 0, 0, 9)));
        assert!(fields.server_public_key.is_none());
    }

    #[tokio::test]
    async fn test_build_writes_all_files() {
        let store = Arc::new(MemoryStore::new());
        store.write("server/publickey-server", "SERVERKEY").await.unwrap();
        let b = builder(store.clone());

        let name = sanitize("alice").unwrap();
        let keys = generate_keypair().unwrap();
        let psk = generate_preshared_key().unwrap();
        let out = b
            .build(&PeerArtifactSpec {
                name: &name,
                address: Ipv4Addr::new(192, 0, 0, 2),
                keys: &keys,
                preshared_key: &psk,
            })
            .await
            .unwrap();

        assert_eq!(out.directory, "alice");
        assert_eq!(out.config_file, "alice.conf");
        let files = store.files();
        assert_eq!(files["alice/privatekey-alice"], keys.private_key);
        assert_eq!(files["alice/publickey-alice"], keys.public_key);
        assert_eq!(files["alice/presharedkey-alice"], psk.as_str());
        assert!(!files["alice/peer.conf"].contains("DNS"));
        assert!(files["alice.conf"].contains("DNS = 8.8.8.8"));
        assert!(files["alice.conf"].contains("Endpoint = vpn.example.net:51820"));
        assert!(files["alice.conf"].contains("PublicKey = SERVERKEY"));

        assert_eq!(
            b.recorded_address(&name).await.unwrap(),
            Some(Ipv4Addr::new(192, 0, 0, 2))
        );
        assert_eq!(
            parse_client_config(&b.read_flat(&name).await.unwrap()).address,
            Some(Ipv4Addr::new(192, 0, 0, 2))
        );
    }

    #[tokio::test]
    async fn test_remove_and_missing_flat() {
        let store = Arc::new(MemoryStore::new());
        let b = builder(store.clone());
        let name = sanitize("bob").unwrap();

        store.write("bob/peer.conf", "x").await.unwrap();
        store.write("bob.conf", "x").await.unwrap();
        assert!(b.remove(&name).await.unwrap());
        assert!(!b.remove(&name).await.unwrap());
        assert!(b.read_flat(&name).await.unwrap_err().is_not_found());
    }
}
