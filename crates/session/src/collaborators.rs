//! Collaborator interfaces
//!
//! Capture/encoding, token issuance, and persistent storage are external
//! collaborators: the session only holds these trait objects. The token
//! issuer trait lives in `deskbridge_core::auth` because the relay shares it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};

/// A media-source provider
///
/// The negotiator creates the outbound track and hands it over; the provider
/// feeds encoded samples into it until detached. Capture and encoding are
/// entirely the provider's business.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Start feeding the given track
    async fn attach(&self, track: Arc<TrackLocalStaticSample>) -> Result<()>;

    /// Stop feeding; called on close and before renegotiating media
    async fn detach(&self);
}

/// Persistent storage for completed file transfers
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Write a completed artifact
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;
}

/// Storage sink writing into a root directory
///
/// Only the file-name component of the requested path is honored, so a
/// malicious header cannot escape the root.
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    /// Create a sink rooted at `root`; the directory is created on first
    /// write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageSink for FsSink {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty() && n != "." && n != "..")
            .unwrap_or_else(|| "transfer.bin".to_string());

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create {:?}: {}", self.root, e)))?;
        let target = self.root.join(name);
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {:?}: {}", target, e)))?;

        Ok(())
    }
}

/// In-memory storage sink
pub struct MemorySink {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Stored bytes for a path, if any
    pub async fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().await.get(path).cloned()
    }

    /// Number of stored artifacts
    pub async fn len(&self) -> usize {
        self.files.lock().await.len()
    }

    /// Whether nothing has been stored
    pub async fn is_empty(&self) -> bool {
        self.files.lock().await.is_empty()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.files
            .lock()
            .await
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_roundtrip() {
        let sink = MemorySink::new();
        sink.write("a.txt", b"hello").await.unwrap();

        assert_eq!(sink.get("a.txt").await, Some(b"hello".to_vec()));
        assert_eq!(sink.get("b.txt").await, None);
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn test_fs_sink_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path());

        sink.write("report.pdf", b"%PDF").await.unwrap();
        let stored = tokio::fs::read(dir.path().join("report.pdf")).await.unwrap();
        assert_eq!(stored, b"%PDF");
    }

    #[tokio::test]
    async fn test_fs_sink_strips_path_components() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path());

        sink.write("../../etc/passwd", b"nope").await.unwrap();
        assert!(dir.path().join("passwd").exists());
        assert!(!dir.path().parent().unwrap().join("passwd").exists());
    }
}
