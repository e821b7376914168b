//! Clipboard synchronization
//!
//! Entries are single control messages bounded by a size limit and a MIME
//! denylist; rejected entries are never sent. Accepted entries (local and
//! remote) land in a bounded history ring, oldest evicted first.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use deskbridge_core::control::{ClipboardContentType, ClipboardEntry, ClipboardSource};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::error::{Error, Result};

/// Clipboard policy and history for one peer pair
pub struct ClipboardManager {
    max_bytes: usize,
    /// Lowercased denylist entries; `.ext` entries apply to file transfers,
    /// the rest are MIME types
    denylist: Vec<String>,
    history: Mutex<VecDeque<ClipboardEntry>>,
    capacity: usize,
}

impl ClipboardManager {
    /// Build from the channel configuration
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            max_bytes: config.max_clipboard_bytes,
            denylist: config
                .clipboard_denylist
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            history: Mutex::new(VecDeque::new()),
            capacity: config.clipboard_history,
        }
    }

    /// Validate an entry against the size limit and MIME denylist
    pub fn check(&self, entry: &ClipboardEntry) -> Result<()> {
        if entry.size_bytes > self.max_bytes {
            return Err(Error::SizeLimitExceeded {
                size: entry.size_bytes as u64,
                limit: self.max_bytes as u64,
            });
        }

        let mime = entry.mime.to_ascii_lowercase();
        if self
            .denylist
            .iter()
            .any(|d| !d.starts_with('.') && *d == mime)
        {
            return Err(Error::PolicyRejected(format!(
                "clipboard MIME type denied: {}",
                entry.mime
            )));
        }

        Ok(())
    }

    /// Check whether a file name's extension is denylisted (used by outgoing
    /// file transfers)
    pub fn check_file_name(&self, name: &str) -> Result<()> {
        let lowered = name.to_ascii_lowercase();
        if self
            .denylist
            .iter()
            .any(|d| d.starts_with('.') && lowered.ends_with(d.as_str()))
        {
            return Err(Error::PolicyRejected(format!(
                "file extension denied: {}",
                name
            )));
        }
        Ok(())
    }

    /// Validate and record a locally captured entry before sending
    pub async fn accept_local(&self, entry: &ClipboardEntry) -> Result<()> {
        self.check(entry)?;
        self.push(entry.clone()).await;
        Ok(())
    }

    /// Validate and record an entry received from the peer
    pub async fn accept_remote(&self, entry: &ClipboardEntry) -> Result<()> {
        self.check(entry)?;
        self.push(entry.clone()).await;
        Ok(())
    }

    /// History snapshot, oldest first
    pub async fn history(&self) -> Vec<ClipboardEntry> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Most recent entry
    pub async fn latest(&self) -> Option<ClipboardEntry> {
        self.history.lock().await.back().cloned()
    }

    async fn push(&self, entry: ClipboardEntry) {
        let mut history = self.history.lock().await;
        history.push_back(entry);
        while history.len() > self.capacity {
            let evicted = history.pop_front();
            if let Some(evicted) = evicted {
                debug!(entry_id = %evicted.id, "Clipboard history evicted oldest entry");
            }
        }
    }
}

/// Build a text entry
pub fn text_entry(text: &str, source: ClipboardSource) -> ClipboardEntry {
    ClipboardEntry {
        id: Uuid::new_v4().to_string(),
        content_type: ClipboardContentType::Text,
        mime: "text/plain".to_string(),
        data: text.to_string(),
        size_bytes: text.len(),
        source,
        timestamp_ms: now_ms(),
    }
}

/// Build an HTML entry
pub fn html_entry(html: &str, source: ClipboardSource) -> ClipboardEntry {
    ClipboardEntry {
        id: Uuid::new_v4().to_string(),
        content_type: ClipboardContentType::Html,
        mime: "text/html".to_string(),
        data: html.to_string(),
        size_bytes: html.len(),
        source,
        timestamp_ms: now_ms(),
    }
}

/// Build an image entry; bytes are base64-encoded for transit
pub fn image_entry(bytes: &[u8], mime: &str, source: ClipboardSource) -> ClipboardEntry {
    ClipboardEntry {
        id: Uuid::new_v4().to_string(),
        content_type: ClipboardContentType::Image,
        mime: mime.to_string(),
        data: BASE64.encode(bytes),
        size_bytes: bytes.len(),
        source,
        timestamp_ms: now_ms(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
