//! WgKeeper Common Library
//!
//! Peer lifecycle management for a WireGuard server: key material, address
//! allocation, the shared server document, per-peer artifacts and the reload
//! queue that makes the live interface pick up changes.

pub mod allocator;
pub mod artifact;
pub mod config;
pub mod error;
pub mod keys;
pub mod manager;
pub mod registry;
pub mod reload;
pub mod server_conf;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use allocator::AddressAllocator;
pub use artifact::{ArtifactBuilder, ServerIdentity, SERVER_PUBLIC_KEY_PLACEHOLDER};
pub use config::{AllocationPolicy, KeeperConfig, ReloadMode};
pub use error::{Error, Result};
pub use keys::{generate_keypair, generate_preshared_key, KeyPair, PresharedKey};
pub use manager::{CreatedPeer, PeerConfigView, PeerManager, PeerSummary, ServerInfo};
pub use registry::{sanitize, PeerName, PeerRegistry};
pub use reload::{
    ContainerReloader, ReloadHandle, ReloadOutcome, ReloadRequest, ReloadTrigger, ReloadWorker,
    RetryPolicy,
};
pub use server_conf::{PeerSection, ServerConfigDocument};
pub use store::{FsStore, MemoryStore, PeerStore, StoreLock};
pub use telemetry::{PeerStats, PrometheusTelemetry, TelemetrySource};

/// WgKeeper version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default location of the WgKeeper config file
pub fn default_config_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".wgkeeper")
        .join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
