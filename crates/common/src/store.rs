//! Peer-directory tree storage
//!
//! Everything WgKeeper persists lives below a single root (the directory the
//! WireGuard container mounts as `/config`). Business logic only talks to the
//! [`PeerStore`] trait so the on-disk tree can be swapped for [`MemoryStore`]
//! in tests.
//!
//! Paths are relative, `/`-separated and may not leave the root.

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use nix::fcntl::{Flock, FlockArg};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Storage interface over the peer-directory tree
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Whether a file or directory exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names of the top-level directories. An absent root lists as empty.
    async fn list(&self) -> Result<Vec<String>>;

    /// Read a text file, `None` if it does not exist
    async fn read(&self, path: &str) -> Result<Option<String>>;

    /// Replace a file in one step, creating parent directories as needed
    async fn write(&self, path: &str, contents: &str) -> Result<()>;

    /// Remove a file or a whole directory tree. Returns whether anything existed.
    async fn remove(&self, path: &str) -> Result<bool>;

    /// Wait for an exclusive lock on `path`, held until the returned guard is
    /// dropped. Other store instances over the same tree (including other
    /// processes for [`FsStore`]) block on the same path.
    async fn lock(&self, path: &str) -> Result<StoreLock>;
}

/// Exclusive lock taken through [`PeerStore::lock`], released on drop
pub struct StoreLock {
    path: String,
    _held: Box<dyn Any + Send + Sync>,
}

impl StoreLock {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock").field("path", &self.path).finish()
    }
}

fn check_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    let escapes = path.is_empty()
        || p.components().any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(Error::Internal(format!("path escapes store root: {:?}", path)));
    }
    Ok(())
}

// ============================================================================
// Filesystem
// ============================================================================

/// Store rooted at a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root path of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        check_relative(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl PeerStore for FsStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(fs::try_exists(&full).await?)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                dirs.push(name);
            }
        }
        Ok(dirs)
    }

    async fn read(&self, path: &str) -> Result<Option<String>> {
        let full = self.resolve(path)?;
        match fs::read_to_string(&full).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, contents: &str) -> Result<()> {
        let full = self.resolve(path)?;
        let parent = full
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await?;

        // Temp file in the same directory so the rename cannot cross devices
        let data = contents.as_bytes().to_vec();
        let target = full.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;

        debug!("Wrote {} ({} bytes)", full.display(), contents.len());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        let meta = match fs::symlink_metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        debug!("Removed {}", full.display());
        Ok(true)
    }

    async fn lock(&self, path: &str) -> Result<StoreLock> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }

        // flock(2) blocks the calling thread until the holder closes its file
        let target = full.clone();
        let held = tokio::task::spawn_blocking(move || -> std::io::Result<Flock<std::fs::File>> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&target)?;
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno.into())
        })
        .await??;

        debug!("Locked {}", full.display());
        Ok(StoreLock {
            path: path.to_string(),
            _held: Box::new(held),
        })
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
struct MemoryTree {
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    failing_prefixes: Vec<String>,
    failing_removes: Vec<String>,
    locks: BTreeMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// In-memory store used as a fake in tests
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tree: Arc<RwLock<MemoryTree>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write below `prefix` fail with an IO error
    pub fn inject_write_failure(&self, prefix: &str) {
        self.tree.write().failing_prefixes.push(prefix.to_string());
    }

    /// Make every later remove below `prefix` fail with an IO error
    pub fn inject_remove_failure(&self, prefix: &str) {
        self.tree.write().failing_removes.push(prefix.to_string());
    }

    /// Snapshot of every stored file, keyed by path
    pub fn files(&self) -> BTreeMap<String, String> {
        self.tree.read().files.clone()
    }
}

#[async_trait]
impl PeerStore for MemoryStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        check_relative(path)?;
        let tree = self.tree.read();
        Ok(tree.files.contains_key(path) || tree.dirs.contains(path))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let tree = self.tree.read();
        Ok(tree
            .dirs
            .iter()
            .filter(|d| !d.contains('/'))
            .cloned()
            .collect())
    }

    async fn read(&self, path: &str) -> Result<Option<String>> {
        check_relative(path)?;
        Ok(self.tree.read().files.get(path).cloned())
    }

    async fn write(&self, path: &str, contents: &str) -> Result<()> {
        check_relative(path)?;
        let mut tree = self.tree.write();
        if tree.failing_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::PermissionDenied,
                format!("injected write failure for {}", path),
            )));
        }

        let mut parent = String::new();
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments[..segments.len() - 1] {
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(segment);
            tree.dirs.insert(parent.clone());
        }
        tree.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        check_relative(path)?;
        let mut tree = self.tree.write();
        if tree.failing_removes.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::PermissionDenied,
                format!("injected remove failure for {}", path),
            )));
        }
        if tree.files.remove(path).is_some() {
            return Ok(true);
        }
        if !tree.dirs.remove(path) {
            return Ok(false);
        }
        let prefix = format!("{}/", path);
        tree.files.retain(|k, _| !k.starts_with(&prefix));
        tree.dirs.retain(|d| !d.starts_with(&prefix));
        Ok(true)
    }

    async fn lock(&self, path: &str) -> Result<StoreLock> {
        check_relative(path)?;
        let mutex = self
            .tree
            .write()
            .locks
            .entry(path.to_string())
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;
        Ok(StoreLock {
            path: path.to_string(),
            _held: Box::new(guard),
        })
    }
}
