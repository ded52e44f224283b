//! Durable storage for reassembled attachments.
//!
//! The inbound core hands every completed attachment to an
//! [`AttachmentBlobStore`] keyed by its file id.  File ids are chosen by the
//! sending peer, so [`FsBlobStore`] never uses them as path components: the
//! on-disk name is the BLAKE3 digest of the id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use entropy_shared::types::FileId;

use crate::error::{Result, StoreError};

#[async_trait]
pub trait AttachmentBlobStore: Send + Sync {
    /// Persist `data` under `file_id`, replacing any previous blob.
    async fn put(&self, file_id: &FileId, data: Bytes) -> Result<()>;

    async fn get(&self, file_id: &FileId) -> Result<Bytes>;
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl FsBlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            StoreError::BlobStorage(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Attachment store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, file_id: &FileId) -> PathBuf {
        self.base_path
            .join(blake3::hash(file_id.as_str().as_bytes()).to_hex().as_str())
    }
}

#[async_trait]
impl AttachmentBlobStore for FsBlobStore {
    async fn put(&self, file_id: &FileId, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Err(StoreError::BlobStorage("Empty blob".to_string()));
        }
        if data.len() > self.max_size {
            return Err(StoreError::BlobTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let path = self.blob_path(file_id);
        let tmp = path.with_extension("part");

        // write-then-rename so readers never see a truncated blob
        fs::write(&tmp, &data).await.map_err(|e| {
            StoreError::BlobStorage(format!("Failed to write blob {}: {}", file_id, e))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            StoreError::BlobStorage(format!("Failed to commit blob {}: {}", file_id, e))
        })?;

        debug!(file_id = %file_id, size = data.len(), "Stored attachment");
        Ok(())
    }

    async fn get(&self, file_id: &FileId) -> Result<Bytes> {
        let path = self.blob_path(file_id);

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::BlobNotFound(file_id.to_string()));
        }

        let data = fs::read(&path).await.map_err(|e| {
            StoreError::BlobStorage(format!("Failed to read blob {}: {}", file_id, e))
        })?;

        debug!(file_id = %file_id, size = data.len(), "Retrieved attachment");
        Ok(Bytes::from(data))
    }
}

/// In-memory blob store for tests and embedders without a filesystem.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<FileId, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl AttachmentBlobStore for MemoryBlobStore {
    async fn put(&self, file_id: &FileId, data: Bytes) -> Result<()> {
        self.blobs.write().await.insert(file_id.clone(), data);
        Ok(())
    }

    async fn get(&self, file_id: &FileId) -> Result<Bytes> {
        self.blobs
            .read()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound(file_id.to_string()))
    }
}
