/// Result store writing artifacts below a local directory

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{object_name, ArtifactCategory, ResultStore};
use crate::error::StorageError;
use crate::models::Package;

pub struct LocalResultStore {
    root: PathBuf,
}

impl LocalResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl ResultStore for LocalResultStore {
    async fn save(&self, category: ArtifactCategory, package: &Package, data: Bytes) -> Result<String, StorageError> {
        let path = self.root.join(object_name(category, package));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(category = %category, bytes = data.len(), "Wrote {}", path.display());
        Ok(format!("file://{}", path.display()))
    }
}
