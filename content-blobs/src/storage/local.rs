//! Filesystem blob provider
//!
//! Stores each binary as one file under the configured root. Locations are
//! random and fanned out over two directory levels:
//!
//! Example: id "3f9a0c..." is stored at "<root>/3f/9a/3f9a0c..."

use crate::error::{BlobStorageError, Result};
use crate::storage::provider::{
    BlobProvider, BlobReadStream, BlobStorageContext, BlobWriteStream, ProviderData,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

pub const LOCAL_PROVIDER_NAME: &str = "LocalBlobProvider";

/// Provider data stored in `Files.BlobProviderData`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBlobData {
    /// Location relative to the provider root
    pub path: String,
}

#[derive(Clone)]
pub struct LocalBlobProvider {
    root: PathBuf,
}

impl LocalBlobProvider {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create the root directory if needed
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        tracing::info!("Local blob provider initialized at: {:?}", self.root);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn new_location() -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}/{}/{}", &id[0..2], &id[2..4], id)
    }

    /// Absolute path of a context's location. Rejects paths escaping the root.
    fn resolve(&self, ctx: &BlobStorageContext) -> Result<PathBuf> {
        let data = ctx.provider_data.typed::<LocalBlobData>()?;
        let relative = Path::new(&data.path);

        if data.path.is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(BlobStorageError::InvalidArgument(format!(
                "invalid local blob path: {}",
                data.path
            )));
        }

        Ok(self.root.join(relative))
    }

    /// Remove empty directories between `path` and the root
    async fn prune_empty_parents(&self, path: &Path) -> Result<()> {
        let mut current = path.parent().map(Path::to_path_buf);

        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            match fs::read_dir(&dir).await {
                Ok(mut entries) => {
                    if entries.next_entry().await?.is_some() {
                        break;
                    }
                    let _ = fs::remove_dir(&dir).await;
                }
                Err(_) => break,
            }
            current = dir.parent().map(Path::to_path_buf);
        }

        Ok(())
    }
}

fn not_found(path: &Path, e: std::io::Error) -> BlobStorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BlobStorageError::NotFound(format!("local blob {:?}", path))
    } else {
        BlobStorageError::Io(e)
    }
}

#[async_trait]
impl BlobProvider for LocalBlobProvider {
    fn name(&self) -> &str {
        LOCAL_PROVIDER_NAME
    }

    fn parse_data(&self, text: &str) -> Result<ProviderData> {
        ProviderData::decode::<LocalBlobData>(text)
    }

    async fn allocate(&self, ctx: &mut BlobStorageContext) -> Result<()> {
        let location = Self::new_location();
        let path = self.root.join(&location);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::File::create(&path).await?;

        ctx.provider_data = ProviderData::external(LocalBlobData { path: location })?;
        tracing::debug!("Allocated local blob: {:?}", path);
        Ok(())
    }

    async fn write(&self, ctx: &BlobStorageContext, offset: i64, buffer: &[u8]) -> Result<()> {
        let offset = u64::try_from(offset).map_err(|_| {
            BlobStorageError::InvalidArgument(format!("negative write offset {}", offset))
        })?;
        let path = self.resolve(ctx)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| not_found(&path, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(buffer).await?;
        file.sync_data().await?;

        tracing::debug!("Wrote {} bytes at offset {} to {:?}", buffer.len(), offset, path);
        Ok(())
    }

    async fn get_stream_for_read(&self, ctx: &BlobStorageContext) -> Result<BlobReadStream> {
        let path = self.resolve(ctx)?;
        let file = fs::File::open(&path).await.map_err(|e| not_found(&path, e))?;
        Ok(Box::new(file))
    }

    async fn get_stream_for_write(&self, ctx: &BlobStorageContext) -> Result<BlobWriteStream> {
        let path = self.resolve(ctx)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| not_found(&path, e))?;
        Ok(Box::new(file))
    }

    async fn clear(&self, ctx: &BlobStorageContext) -> Result<()> {
        let path = self.resolve(ctx)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| not_found(&path, e))?;
        file.set_len(0).await?;
        Ok(())
    }

    /// Deleting a missing location succeeds
    async fn delete(&self, ctx: &BlobStorageContext) -> Result<()> {
        let path = self.resolve(ctx)?;

        match fs::remove_file(&path).await {
            Ok(()) => tracing::debug!("Deleted local blob: {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        self.prune_empty_parents(&path).await
    }
}
