//! Peer lifecycle
//!
//! [`PeerManager`] wires the registry, allocator, server document and
//! artifact builder into the create / delete / list workflows. Create and
//! delete run one at a time: an in-process lifecycle lock orders tasks of this
//! manager, and the document's file lock orders every other manager and
//! process working on the same tree. The peer count used for allocation and
//! the document edit are never interleaved with another change.

use crate::allocator::AddressAllocator;
use crate::artifact::{ArtifactBuilder, PeerArtifactSpec, ServerIdentity};
use crate::config::{AllocationPolicy, KeeperConfig, SERVER_PUBLIC_KEY_PATH};
use crate::keys::{generate_keypair, generate_preshared_key};
use crate::registry::{sanitize, PeerName, PeerRegistry};
use crate::reload::{ReloadHandle, ReloadOutcome, ReloadRequest, ReloadTrigger};
use crate::server_conf::{section_names, PeerSection, ServerConfigDocument};
use crate::store::PeerStore;
use crate::telemetry::{PeerStats, TelemetrySource};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Returned by a successful create
#[derive(Debug, Clone, Serialize)]
pub struct CreatedPeer {
    pub name: PeerName,
    pub address: Ipv4Addr,
    pub public_key: String,
    pub config_file: String,
    pub directory: String,
    /// The server key was not available and a placeholder was written
    pub server_key_pending: bool,
}

/// One row of a peer listing
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub name: PeerName,
    pub address: Option<Ipv4Addr>,
    pub public_key: Option<String>,
    /// Directory exists but the server document has no section for it
    pub orphaned: bool,
    pub metrics: Option<PeerStats>,
}

/// A peer's flat document with optional telemetry
#[derive(Debug, Clone, Serialize)]
pub struct PeerConfigView {
    pub name: PeerName,
    pub config: String,
    pub metrics: Option<PeerStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_error: Option<String>,
}

/// Server-side overview
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub server_public_key: String,
    pub public_key_present: bool,
    pub server_conf_present: bool,
    pub peer_count: usize,
    pub wireguard_path: String,
    /// Sections in the server document with no peer directory
    pub orphaned_sections: Vec<String>,
}

/// Peer lifecycle workflows
pub struct PeerManager {
    registry: PeerRegistry,
    document: ServerConfigDocument,
    identity: ServerIdentity,
    artifacts: ArtifactBuilder,
    allocator: AddressAllocator,
    policy: AllocationPolicy,
    wireguard_path: String,
    reload: ReloadHandle,
    reload_request: ReloadRequest,
    trigger: Option<Arc<dyn ReloadTrigger>>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    lifecycle: Mutex<()>,
}

impl PeerManager {
    pub fn new(config: &KeeperConfig, store: Arc<dyn PeerStore>) -> Result<Self> {
        config.validate()?;
        let identity = ServerIdentity::new(store.clone(), SERVER_PUBLIC_KEY_PATH);
        let artifacts = ArtifactBuilder::new(
            store.clone(),
            identity.clone(),
            config.endpoint.clone(),
            config.listen_port,
            config.dns.clone(),
        );

        Ok(Self {
            registry: PeerRegistry::new(store.clone()),
            document: ServerConfigDocument::new(store, config.server_conf_rel()),
            identity,
            artifacts,
            allocator: AddressAllocator::new(config.subnet()?, config.host_offset),
            policy: config.allocation,
            wireguard_path: config.wireguard_path.display().to_string(),
            reload: ReloadHandle::disabled(),
            reload_request: config.reload.mode.into(),
            trigger: None,
            telemetry: None,
            lifecycle: Mutex::new(()),
        })
    }

    /// Queue reload requests on this handle after each change
    pub fn with_reload(mut self, handle: ReloadHandle) -> Self {
        self.reload = handle;
        self
    }

    /// Trigger used by [`PeerManager::reload_now`]
    pub fn with_trigger(mut self, trigger: Arc<dyn ReloadTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn document(&self) -> &ServerConfigDocument {
        &self.document
    }

    async fn allocate(&self) -> Result<Ipv4Addr> {
        let count = self.registry.count().await?;
        match self.policy {
            AllocationPolicy::Count => self.allocator.next_address(count),
            AllocationPolicy::Verified => {
                let taken = self.document.addresses().await?;
                self.allocator.next_free(count, &taken)
            }
        }
    }

    /// Create a peer: keys, address, server section, artifacts, then a queued reload
    pub async fn create(&self, raw_name: &str) -> Result<CreatedPeer> {
        let name = sanitize(raw_name)?;
        let _guard = self.lifecycle.lock().await;
        let _file_lock = self.document.lock().await?;

        if self.registry.exists(&name).await? {
            return Err(Error::already_exists("peer", name.as_str()));
        }
        if !self.document.exists().await? {
            return Err(Error::not_found("server config", self.document.path()));
        }

        let keys = generate_keypair()?;
        let preshared_key = generate_preshared_key()?;
        let address = self.allocate().await?;

        self.document
            .insert(&PeerSection {
                name: name.clone(),
                public_key: keys.public_key.clone(),
                preshared_key: preshared_key.clone(),
                address,
            })
            .await?;

        let spec = PeerArtifactSpec {
            name: &name,
            address,
            keys: &keys,
            preshared_key: &preshared_key,
        };
        let artifacts = match self.artifacts.build(&spec).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                self.roll_back(&name).await;
                return Err(e);
            }
        };

        info!("Created peer {} at {}", name, address);
        self.reload.notify(self.reload_request);

        Ok(CreatedPeer {
            server_key_pending: ServerIdentity::is_placeholder(&artifacts.server_public_key),
            name,
            address,
            public_key: keys.public_key,
            config_file: artifacts.config_file,
            directory: artifacts.directory,
        })
    }

    /// Undo a half-finished create
    async fn roll_back(&self, name: &PeerName) {
        warn!("Rolling back partially created peer {}", name);
        if let Err(e) = self.document.remove(name).await {
            error!("Could not remove section {} during rollback: {}; manual cleanup needed", name, e);
        }
        if let Err(e) = self.artifacts.remove(name).await {
            error!("Could not remove files of {} during rollback: {}; manual cleanup needed", name, e);
        }
    }

    /// Delete a peer. An absent section is `NotFound` and nothing is touched.
    ///
    /// The reload is queued as soon as the section is gone, so a failure while
    /// removing the peer's files still takes the peer off the live interface.
    pub async fn delete(&self, raw_name: &str) -> Result<PeerName> {
        let name = sanitize(raw_name)?;
        let _guard = self.lifecycle.lock().await;
        let _file_lock = self.document.lock().await?;

        self.document.remove(&name).await?;
        self.reload.notify(self.reload_request);

        if let Err(e) = self.artifacts.remove(&name).await {
            error!("Section {} removed but its files remain: {}", name, e);
            return Err(e);
        }

        info!("Deleted peer {}", name);
        Ok(name)
    }

    async fn section_name_set(&self) -> Result<HashSet<String>> {
        match self.document.read().await {
            Ok(doc) => Ok(section_names(&doc).into_iter().collect()),
            Err(e) if e.is_not_found() => Ok(HashSet::new()),
            Err(e) => Err(e),
        }
    }

    async fn lookup_public_key(&self, name: &PeerName) -> Result<Option<String>> {
        if let Some(key) = self.registry.public_key(name).await? {
            return Ok(Some(key));
        }
        self.document.public_key(name).await
    }

    async fn metrics_for(&self, name: &PeerName, public_key: Option<&str>) -> Option<PeerStats> {
        let telemetry = self.telemetry.as_ref()?;
        let public_key = public_key?;
        match telemetry.peer_stats(public_key).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Could not fetch metrics for peer {}: {}", name, e);
                None
            }
        }
    }

    /// All peers, optionally enriched with telemetry
    pub async fn list(&self, with_metrics: bool) -> Result<Vec<PeerSummary>> {
        let sections = self.section_name_set().await?;
        let mut peers = Vec::new();

        for name in self.registry.list().await? {
            let public_key = self.lookup_public_key(&name).await?;
            let metrics = if with_metrics {
                self.metrics_for(&name, public_key.as_deref()).await
            } else {
                None
            };
            peers.push(PeerSummary {
                address: self.artifacts.recorded_address(&name).await?,
                orphaned: !sections.contains(name.as_str()),
                name,
                public_key,
                metrics,
            });
        }
        Ok(peers)
    }

    /// The flat user-facing document of a peer
    pub async fn config(&self, raw_name: &str) -> Result<String> {
        let name = sanitize(raw_name)?;
        self.artifacts.read_flat(&name).await
    }

    /// Flat document plus, on request, telemetry. A telemetry failure is
    /// reported in the view and never fails the lookup.
    pub async fn show(&self, raw_name: &str, with_metrics: bool) -> Result<PeerConfigView> {
        let name = sanitize(raw_name)?;
        let config = self.artifacts.read_flat(&name).await?;

        let (metrics, metrics_error) = if with_metrics {
            match self.metrics(name.as_str()).await {
                Ok(stats) => (stats, None),
                Err(e) => {
                    warn!("Metrics unavailable for peer {}: {}", name, e);
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        Ok(PeerConfigView {
            name,
            config,
            metrics,
            metrics_error,
        })
    }

    /// Telemetry for one peer
    pub async fn metrics(&self, raw_name: &str) -> Result<Option<PeerStats>> {
        let name = sanitize(raw_name)?;
        if !self.registry.exists(&name).await? {
            return Err(Error::not_found("peer", name.as_str()));
        }
        let telemetry = self
            .telemetry
            .as_ref()
            .ok_or_else(|| Error::Unavailable("telemetry is not configured".to_string()))?;
        let public_key = self
            .lookup_public_key(&name)
            .await?
            .ok_or_else(|| Error::not_found("public key", name.as_str()))?;
        telemetry.peer_stats(&public_key).await
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        let peers: HashSet<String> = self
            .registry
            .list()
            .await?
            .into_iter()
            .map(|n| n.to_string())
            .collect();
        let orphaned_sections = match self.document.read().await {
            Ok(doc) => section_names(&doc)
                .into_iter()
                .filter(|s| !peers.contains(s))
                .collect(),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok(ServerInfo {
            server_public_key: self.identity.public_key().await,
            public_key_present: self.identity.is_available().await,
            server_conf_present: self.document.exists().await?,
            peer_count: peers.len(),
            wireguard_path: self.wireguard_path.clone(),
            orphaned_sections,
        })
    }

    /// Restart the interface now and report the outcome
    pub async fn reload_now(&self) -> ReloadOutcome {
        match &self.trigger {
            Some(trigger) => trigger.restart().await,
            None => ReloadOutcome::failed("No reload trigger configured"),
        }
    }
}
