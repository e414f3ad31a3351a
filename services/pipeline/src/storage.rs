//! Byte storage for videos and encoded frames.
//!
//! Tasks carry references, never payloads. A reference is either a key
//! relative to the store root (`frames/{video_id}/{index}.jpg`) or, for the
//! filesystem store, an absolute path handed over by the uploader.

use crate::config::{StorageBackend, StorageConfig};
use crate::integrity;
use crate::s3::S3FrameStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("I/O error on {reference}: {source}")]
    Io {
        reference: String,
        #[source]
        source: io::Error,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    fn io(reference: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(reference.to_string())
        } else {
            StorageError::Io {
                reference: reference.to_string(),
                source,
            }
        }
    }
}

/// Deterministic reference for a sampled frame; re-extraction overwrites
pub fn frame_reference(video_id: &str, index: u64) -> String {
    format!("frames/{}/{}.jpg", sanitize_path_component(video_id), index)
}

pub fn video_reference(video_id: &str) -> String {
    format!("videos/{}.mp4", sanitize_path_component(video_id))
}

/// Replace anything that could escape a directory
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Persist an encoded frame and return its reference
    async fn save_frame(&self, video_id: &str, index: u64, bytes: &[u8]) -> Result<String, StorageError>;

    /// Persist an uploaded video and return its reference
    async fn save_video(&self, video_id: &str, bytes: &[u8]) -> Result<String, StorageError>;

    async fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, reference: &str) -> Result<(), StorageError>;

    fn digest(&self, bytes: &[u8]) -> String {
        integrity::digest(bytes)
    }

    /// Local file backing a reference, when there is one
    fn local_path(&self, _reference: &str) -> Option<PathBuf> {
        None
    }
}

/// Build the configured store
pub async fn build_store(config: &StorageConfig) -> Result<Arc<dyn FrameStore>, StorageError> {
    match config.backend {
        StorageBackend::Filesystem => Ok(Arc::new(FileSystemStore::new(&config.base_path))),
        StorageBackend::S3 => Ok(Arc::new(S3FrameStore::new(&config.s3).await?)),
    }
}

/// Store rooted at a directory, by default `/data`
#[derive(Debug, Clone)]
pub struct FileSystemStore {
    base: PathBuf,
}

impl FileSystemStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, StorageError> {
        let path = Path::new(reference);
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
            || reference.is_empty()
        {
            return Err(StorageError::InvalidReference(reference.to_string()));
        }

        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.base.join(path))
        }
    }

    async fn write(&self, reference: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(reference)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(reference, e))?;
        }

        // Readers never see a partially written file.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StorageError::io(reference, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::io(reference, e));
        }

        debug!(path = %path.display(), size = bytes.len(), "Stored object");
        Ok(())
    }
}

#[async_trait]
impl FrameStore for FileSystemStore {
    async fn save_frame(&self, video_id: &str, index: u64, bytes: &[u8]) -> Result<String, StorageError> {
        let reference = frame_reference(video_id, index);
        self.write(&reference, bytes).await?;
        Ok(reference)
    }

    async fn save_video(&self, video_id: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let reference = video_reference(video_id);
        self.write(&reference, bytes).await?;
        Ok(reference)
    }

    async fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(reference)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| StorageError::io(reference, e))
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        let path = self.resolve(reference)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| StorageError::io(reference, e))
    }

    fn local_path(&self, reference: &str) -> Option<PathBuf> {
        self.resolve(reference).ok()
    }
}

/// In-memory store for tests and local runs
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    unavailable: Arc<RwLock<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place bytes under a reference directly, bypassing the frame layout
    pub fn insert(&self, reference: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.write().insert(reference.into(), bytes.into());
    }

    pub fn get(&self, reference: &str) -> Option<Vec<u8>> {
        self.objects.read().get(reference).cloned()
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.objects.read().contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Make every operation fail with a backend error until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write() = unavailable;
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if *self.unavailable.read() {
            Err(StorageError::Backend("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FrameStore for MemoryStore {
    async fn save_frame(&self, video_id: &str, index: u64, bytes: &[u8]) -> Result<String, StorageError> {
        self.check_available()?;
        let reference = frame_reference(video_id, index);
        self.insert(reference.clone(), bytes);
        Ok(reference)
    }

    async fn save_video(&self, video_id: &str, bytes: &[u8]) -> Result<String, StorageError> {
        self.check_available()?;
        let reference = video_reference(video_id);
        self.insert(reference.clone(), bytes);
        Ok(reference)
    }

    async fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        self.check_available()?;
        self.get(reference)
            .ok_or_else(|| StorageError::NotFound(reference.to_string()))
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.objects
            .write()
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_reference_is_deterministic() {
        assert_eq!(frame_reference("vid-1", 30), "frames/vid-1/30.jpg");
        assert_eq!(frame_reference("vid-1", 30), frame_reference("vid-1", 30));
        assert_eq!(frame_reference("../etc", 0), "frames/___etc/0.jpg");
    }

    #[tokio::test]
    async fn test_filesystem_overwrites_same_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemStore::new(dir.path());

        let first = store.save_frame("vid", 60, b"first").await.unwrap();
        let second = store.save_frame("vid", 60, b"second").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.read(&first).await.unwrap(), b"second");

        let frames = std::fs::read_dir(dir.path().join("frames/vid")).unwrap().count();
        assert_eq!(frames, 1);
    }

    #[tokio::test]
    async fn test_filesystem_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemStore::new(dir.path());
        assert!(matches!(
            store.read("videos/nope.mp4").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("videos/nope.mp4").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_filesystem_rejects_traversal() {
        let store = FileSystemStore::new("/data");
        assert!(matches!(
            store.read("frames/../../etc/passwd").await,
            Err(StorageError::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn test_filesystem_accepts_absolute_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.mp4");
        std::fs::write(&path, b"video").unwrap();

        let store = FileSystemStore::new("/data");
        let reference = path.to_string_lossy().to_string();
        assert_eq!(store.read(&reference).await.unwrap(), b"video");
        assert_eq!(store.local_path(&reference), Some(path));
    }

    #[tokio::test]
    async fn test_memory_store_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.save_frame("v", 0, b"x").await,
            Err(StorageError::Backend(_))
        ));
        store.set_unavailable(false);
        let reference = store.save_frame("v", 0, b"x").await.unwrap();
        assert_eq!(store.digest(&store.read(&reference).await.unwrap()), integrity::digest(b"x"));
    }
}
