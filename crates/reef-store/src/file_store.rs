//! File-based payload storage backend.
//!
//! Stores one file per object under its container:
//! `{base_dir}/{container_hex}/{object_hex[0..2]}/{object_hex}`.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use reef_types::{ContainerId, ObjectAddress, ObjectId, PayloadHash};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{PayloadStore, StorageUsage};

/// File-based payload store.
///
/// Writes are atomic: data goes to a temporary file in the target directory
/// first and is then renamed into place, so a crash never leaves a
/// half-written payload under its final name.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Compute the full file path for an object address.
    fn payload_path(&self, addr: &ObjectAddress) -> PathBuf {
        let oid = addr.object_id.to_string();
        self.base_dir
            .join(addr.container_id.to_string())
            .join(&oid[0..2])
            .join(&oid)
    }

    /// Walk the layout and return every address with its payload size.
    async fn scan(&self) -> Result<Vec<(ObjectAddress, u64)>, StoreError> {
        let mut found = Vec::new();

        let mut containers = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(c) = containers.next_entry().await? {
            if !c.file_type().await?.is_dir() {
                continue;
            }
            let Some(container_id) = c
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ContainerId>().ok())
            else {
                continue;
            };

            let mut fanout = tokio::fs::read_dir(c.path()).await?;
            while let Some(d) = fanout.next_entry().await? {
                if !d.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(d.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    let meta = entry.metadata().await?;
                    if !meta.is_file() {
                        continue;
                    }
                    // Leftover temp files fail to parse and are skipped.
                    if let Some(object_id) = entry
                        .file_name()
                        .to_str()
                        .and_then(|name| name.parse::<ObjectId>().ok())
                    {
                        found.push((ObjectAddress::new(container_id, object_id), meta.len()));
                    }
                }
            }
        }

        Ok(found)
    }
}

#[async_trait::async_trait]
impl PayloadStore for FileStore {
    async fn put(&self, addr: ObjectAddress, data: Bytes) -> Result<(), StoreError> {
        let path = self.payload_path(&addr);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(%addr, path = %path.display(), size = data.len(), "stored payload to file");
        Ok(())
    }

    async fn get(&self, addr: ObjectAddress) -> Result<Option<Bytes>, StoreError> {
        let path = self.payload_path(&addr);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn delete(&self, addr: ObjectAddress) -> Result<(), StoreError> {
        let path = self.payload_path(&addr);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%addr, "deleted payload file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn contains(&self, addr: ObjectAddress) -> Result<bool, StoreError> {
        let path = self.payload_path(&addr);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list(&self) -> Result<Vec<ObjectAddress>, StoreError> {
        Ok(self.scan().await?.into_iter().map(|(a, _)| a).collect())
    }

    async fn usage(&self) -> Result<StorageUsage, StoreError> {
        let entries = self.scan().await?;
        Ok(StorageUsage {
            objects: entries.len() as u64,
            used_bytes: entries.iter().map(|(_, len)| len).sum(),
        })
    }

    async fn verify(
        &self,
        addr: ObjectAddress,
        expected: &PayloadHash,
    ) -> Result<bool, StoreError> {
        match self.get(addr).await? {
            Some(data) => Ok(PayloadHash::from_data(&data) == *expected),
            None => Err(StoreError::NotFound(addr)),
        }
    }
}
