//! Server configuration document
//!
//! The server's `wg0.conf` is plain text with no schema. Peer sections are
//! recognised by a `[Peer]` header followed (somewhere before the next header)
//! by a comment line `# <peer-name>`; that comment is the only anchor the
//! format offers for finding a peer again. Edits are surgical: every line that
//! does not belong to the inserted or removed section is kept byte-for-byte.
//!
//! Layout of one peer section:
//!
//! ```text
//! [Peer]
//! # alice
//! PublicKey = <base64>
//! PresharedKey = <base64>
//! AllowedIPs = 192.0.0.2/32
//! ```

use crate::keys::PresharedKey;
use crate::registry::PeerName;
use crate::store::{PeerStore, StoreLock};
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

// ============================================================================
// Section model
// ============================================================================

/// One peer's section in the server document
#[derive(Debug, Clone)]
pub struct PeerSection {
    pub name: PeerName,
    pub public_key: String,
    pub preshared_key: PresharedKey,
    pub address: Ipv4Addr,
}

impl PeerSection {
    /// Section text, starting with a blank separator line
    pub fn render(&self) -> String {
        format!(
            "\n[Peer]\n# {name}\nPublicKey = {public_key}\nPresharedKey = {psk}\nAllowedIPs = {address}/32\n",
            name = self.name,
            public_key = self.public_key,
            psk = self.preshared_key.as_str(),
            address = self.address,
        )
    }
}

fn is_header(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('[') && t.ends_with(']')
}

fn is_peer_header(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("[peer]")
}

/// Closing bracket of a wrapped section list
fn is_closing_marker(line: &str) -> bool {
    line.trim() == "]"
}

fn is_boundary(line: &str) -> bool {
    is_header(line) || is_closing_marker(line)
}

fn tag_of(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix('#')
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let t = line.trim();
    if t.starts_with('#') {
        return None;
    }
    let (k, v) = t.split_once('=')?;
    Some((k.trim(), v.trim()))
}

/// Line range `[start, end)` of one `[Peer]` section
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

/// Single pass over the lines, collecting every `[Peer]` section
fn peer_spans(lines: &[&str]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if !is_peer_header(lines[i]) {
            i += 1;
            continue;
        }
        let start = i;
        i += 1;
        while i < lines.len() && !is_boundary(lines[i]) {
            i += 1;
        }
        spans.push(Span { start, end: i });
    }
    spans
}

fn span_has_tag(lines: &[&str], span: Span, name: &str) -> bool {
    lines[span.start + 1..span.end]
        .iter()
        .any(|l| tag_of(l) == Some(name))
}

fn span_tag<'a>(lines: &[&'a str], span: Span) -> Option<&'a str> {
    lines[span.start + 1..span.end].iter().copied().find_map(tag_of)
}

// ============================================================================
// Pure document edits
// ============================================================================

/// Insert a section: before a trailing `]` marker if the document ends with
/// one, otherwise at the end
pub fn insert_section(doc: &str, section: &PeerSection) -> String {
    let block = section.render();

    if doc.trim_end().ends_with(']') {
        let lines: Vec<&str> = doc.split('\n').collect();
        if let Some(pos) = lines.iter().rposition(|l| !l.trim().is_empty()) {
            if is_closing_marker(lines[pos]) {
                let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 1);
                out.extend_from_slice(&lines[..pos]);
                out.push(block.trim_end_matches('\n'));
                out.extend_from_slice(&lines[pos..]);
                return out.join("\n");
            }
        }
    }

    format!("{}{}", doc, block)
}

/// Remove every section tagged `# <name>`. `None` when no section carries the tag.
pub fn remove_section(doc: &str, name: &str) -> Option<String> {
    let lines: Vec<&str> = doc.split('\n').collect();
    let doomed: Vec<Span> = peer_spans(&lines)
        .into_iter()
        .filter(|s| span_has_tag(&lines, *s, name))
        .collect();
    if doomed.is_empty() {
        return None;
    }

    let mut out = Vec::with_capacity(lines.len());
    let mut next = 0;
    for span in doomed {
        out.extend_from_slice(&lines[next..span.start]);
        next = span.end;
    }
    out.extend_from_slice(&lines[next..]);

    let mut updated = out.join("\n");
    if doc.ends_with('\n') && !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    Some(updated)
}

/// Whether a section tagged `# <name>` exists
pub fn has_section(doc: &str, name: &str) -> bool {
    let lines: Vec<&str> = doc.split('\n').collect();
    peer_spans(&lines)
        .into_iter()
        .any(|s| span_has_tag(&lines, s, name))
}

/// Tags of all peer sections, in document order
pub fn section_names(doc: &str) -> Vec<String> {
    let lines: Vec<&str> = doc.split('\n').collect();
    peer_spans(&lines)
        .into_iter()
        .filter_map(|s| span_tag(&lines, s).map(str::to_string))
        .collect()
}

/// Every address peers are allowed to use
pub fn allowed_addresses(doc: &str) -> HashSet<Ipv4Addr> {
    let lines: Vec<&str> = doc.split('\n').collect();
    let mut out = HashSet::new();
    for span in peer_spans(&lines) {
        for line in &lines[span.start + 1..span.end] {
            let Some((key, value)) = key_value(line) else {
                continue;
            };
            if !key.eq_ignore_ascii_case("AllowedIPs") {
                continue;
            }
            out.extend(
                value
                    .split(',')
                    .filter_map(|v| v.trim().parse::<Ipv4Network>().ok())
                    .map(|n| n.ip()),
            );
        }
    }
    out
}

/// `PublicKey` of the section tagged `# <name>`
pub fn section_public_key(doc: &str, name: &str) -> Option<String> {
    let lines: Vec<&str> = doc.split('\n').collect();
    let span = peer_spans(&lines)
        .into_iter()
        .find(|s| span_has_tag(&lines, *s, name))?;
    lines[span.start + 1..span.end].iter().find_map(|l| {
        key_value(l)
            .filter(|(k, _)| k.eq_ignore_ascii_case("PublicKey"))
            .map(|(_, v)| v.to_string())
    })
}

// ============================================================================
// Shared document
// ============================================================================

/// Single writer for the server document
///
/// Every mutation reads the whole document, edits it in memory and replaces
/// the file in one write, all while holding the writer lock. The writer lock
/// only covers this instance; writers in other processes are excluded by
/// holding [`ServerConfigDocument::lock`] around the whole change.
pub struct ServerConfigDocument {
    store: Arc<dyn PeerStore>,
    path: String,
    writer: Mutex<()>,
}

impl ServerConfigDocument {
    pub fn new(store: Arc<dyn PeerStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    /// Path relative to the store root
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn exists(&self) -> Result<bool> {
        self.store.exists(&self.path).await
    }

    /// Exclusive lock on `<path>.lock`, shared with every other process
    /// editing the same tree. Not reentrant: take it once per change.
    pub async fn lock(&self) -> Result<StoreLock> {
        self.store.lock(&format!("{}.lock", self.path)).await
    }

    /// Full document text
    pub async fn read(&self) -> Result<String> {
        self.store
            .read(&self.path)
            .await?
            .ok_or_else(|| Error::not_found("server config", self.path.clone()))
    }

    /// Add a peer section
    pub async fn insert(&self, section: &PeerSection) -> Result<()> {
        let _guard = self.writer.lock().await;

        let doc = self.read().await?;
        if has_section(&doc, section.name.as_str()) {
            return Err(Error::already_exists("peer section", section.name.as_str()));
        }

        let updated = insert_section(&doc, section);
        self.store.write(&self.path, &updated).await?;

        info!(
            "Added peer section {} ({}/32) to {}",
            section.name, section.address, self.path
        );
        Ok(())
    }

    /// Drop a peer section. The document is left untouched when the peer is absent.
    pub async fn remove(&self, name: &PeerName) -> Result<()> {
        let _guard = self.writer.lock().await;

        let doc = self.read().await?;
        let updated = remove_section(&doc, name.as_str())
            .ok_or_else(|| Error::not_found("peer section", name.as_str()))?;
        self.store.write(&self.path, &updated).await?;

        info!("Removed peer section {} from {}", name, self.path);
        Ok(())
    }

    /// Addresses currently assigned in the document
    pub async fn addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let doc = self.read().await?;
        let addrs = allowed_addresses(&doc);
        debug!("{} holds {} peer addresses", self.path, addrs.len());
        Ok(addrs)
    }

    /// Tags of all peer sections
    pub async fn peer_names(&self) -> Result<Vec<String>> {
        Ok(section_names(&self.read().await?))
    }

    /// Public key recorded for a peer
    pub async fn public_key(&self, name: &PeerName) -> Result<Option<String>> {
        match self.store.read(&self.path).await? {
            Some(doc) => Ok(section_public_key(&doc, name.as_str())),
            None => Ok(None),
        }
    }
}
