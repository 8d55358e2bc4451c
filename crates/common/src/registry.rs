//! Peer registry
//!
//! A peer exists when a directory with its name exists below the WireGuard
//! root. Names coming from outside must go through [`sanitize`] before they
//! touch a path or the server document.

use crate::config::RESERVED_DIRS;
use crate::store::PeerStore;
use crate::{Error, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Sanitized peer name: lowercase ASCII alphanumerics, `-` and `_`, never empty
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerName(String);

impl PeerName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory holding the peer's key files
    pub fn dir(&self) -> String {
        self.0.clone()
    }

    /// Flat user-facing document
    pub fn flat_conf(&self) -> String {
        format!("{}.conf", self.0)
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for PeerName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Keep alphanumerics, `-` and `_`, lowercased
pub fn sanitize_raw(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Sanitize an external name; fails when nothing usable is left
pub fn sanitize(raw: &str) -> Result<PeerName> {
    let name = sanitize_raw(raw);
    if name.is_empty() || RESERVED_DIRS.contains(&name.as_str()) {
        return Err(Error::InvalidName(raw.to_string()));
    }
    Ok(PeerName(name))
}

/// Filesystem view of the peers
#[derive(Clone)]
pub struct PeerRegistry {
    store: Arc<dyn PeerStore>,
}

impl PeerRegistry {
    pub fn new(store: Arc<dyn PeerStore>) -> Self {
        Self { store }
    }

    pub async fn exists(&self, name: &PeerName) -> Result<bool> {
        self.store.exists(&name.dir()).await
    }

    /// All peers, sorted by name. Directories whose name is not already in
    /// sanitized form cannot be addressed by any command and are skipped.
    pub async fn list(&self) -> Result<Vec<PeerName>> {
        let mut peers: Vec<PeerName> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|d| !RESERVED_DIRS.contains(&d.as_str()))
            .filter_map(|d| match sanitize(&d) {
                Ok(name) if name.as_str() == d => Some(name),
                _ => {
                    warn!("Ignoring directory {:?}: not a valid peer name", d);
                    None
                }
            })
            .collect();
        peers.sort();
        Ok(peers)
    }

    /// Number of peer directories
    pub async fn count(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    /// Public key from `<name>/publickey-<name>`
    pub async fn public_key(&self, name: &PeerName) -> Result<Option<String>> {
        let path = format!("{}/publickey-{}", name.dir(), name);
        Ok(self
            .store
            .read(&path)
            .await?
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_sanitize_strips_and_lowercases() {
        assert_eq!(sanitize_raw("My Peer!! / .."), "mypeer");
        assert_eq!(sanitize("Laptop_01-Home").unwrap().as_str(), "laptop_01-home");
    }

    #[test]
    fn test_sanitize_rejects_empty_and_reserved() {
        assert!(matches!(sanitize("!!/.."), Err(Error::InvalidName(_))));
        assert!(matches!(sanitize(""), Err(Error::InvalidName(_))));
        assert!(matches!(sanitize("WG_CONFS"), Err(Error::InvalidName(_))));
        assert!(matches!(sanitize("server"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_sanitize_drops_non_ascii() {
        assert_eq!(sanitize_raw("café-ü"), "caf-");
    }

    #[tokio::test]
    async fn test_list_excludes_reserved_dirs() {
        let store = Arc::new(MemoryStore::new());
        store.write("server/publickey-server", "k").await.unwrap();
        store.write("templates/peer.conf", "t").await.unwrap();
        store.write("wg_confs/wg0.conf", "c").await.unwrap();
        store.write("zoe/peer.conf", "p").await.unwrap();
        store.write("adam/peer.conf", "p").await.unwrap();

        let registry = PeerRegistry::new(store);
        let names: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(names, vec!["adam", "zoe"]);
        assert_eq!(registry.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_list_skips_unsanitized_dirs() {
        let store = Arc::new(MemoryStore::new());
        store.write("Bob/peer.conf", "p").await.unwrap();
        store.write("my peer/peer.conf", "p").await.unwrap();
        store.write(".git/HEAD", "ref").await.unwrap();
        store.write("bob_2/peer.conf", "p").await.unwrap();

        let registry = PeerRegistry::new(store);
        let names: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(names, vec!["bob_2"]);
        assert_eq!(registry.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exists_and_public_key() {
        let store = Arc::new(MemoryStore::new());
        store.write("alice/publickey-alice", "PUB\n").await.unwrap();
        let registry = PeerRegistry::new(store);

        let alice = sanitize("alice").unwrap();
        let bob = sanitize("bob").unwrap();
        assert!(registry.exists(&alice).await.unwrap());
        assert!(!registry.exists(&bob).await.unwrap());
        assert_eq!(registry.public_key(&alice).await.unwrap().as_deref(), Some("PUB"));
        assert!(registry.public_key(&bob).await.unwrap().is_none());
    }
}
