use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use crate::appresult::{AppResult, PortalError};

/// A named bucket of path-addressed blobs on local disk.
#[derive(Clone, Debug)]
pub struct Bucket {
    name: Arc<str>,
    root: Arc<Path>,
    public_url: Arc<str>,
}

impl Bucket {
    pub fn new(name: &str, root: impl Into<PathBuf>, public_url: &str) -> Self {
        let root: PathBuf = root.into();
        Self {
            name: name.into(),
            root: Arc::from(root),
            public_url: public_url.trim_end_matches('/').into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, path: &str) -> AppResult<PathBuf> {
        let relative = Path::new(path);
        let plain = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(PortalError::Validation(format!("invalid object path {path:?}")))?;
        }
        Ok(self.root.join(self.name.as_ref()).join(relative))
    }

    pub async fn upload(&self, path: &str, bytes: &[u8]) -> AppResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        tracing::debug!(bucket = %self.name, path, size = bytes.len(), "stored object");
        Ok(())
    }

    pub async fn download(&self, path: &str) -> AppResult<Vec<u8>> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(PortalError::NotFound("object"))?,
            Err(err) => Err(err)?,
        }
    }

    /// Removing a missing object is not an error.
    pub async fn remove(&self, path: &str) -> AppResult<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err)?,
            _ => Ok(()),
        }
    }

    pub fn public_url(&self, path: &str) -> String {
        format!("{}/{}/{path}", self.public_url, self.name)
    }
}
