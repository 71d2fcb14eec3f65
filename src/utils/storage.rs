//! Moving inputs in and results out of the run's working area.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, warn};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Makes the object behind `handle` available locally and returns its path.
    async fn download(&self, handle: &str) -> Result<PathBuf>;

    /// Publishes a local file and returns a handle that `download` accepts.
    async fn upload(&self, path: &Path) -> Result<String>;
}

/// Storage backed by the local filesystem. Handles are plain paths or `file://` URIs;
/// uploads are copied into `destination`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    destination: PathBuf,
}

impl LocalStorage {
    pub fn new(destination: PathBuf) -> Self {
        LocalStorage { destination }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

fn resolve_handle(handle: &str) -> Result<PathBuf> {
    if let Some(rest) = handle.strip_prefix("file://") {
        return Ok(PathBuf::from(rest));
    }
    if let Some((scheme, _)) = handle.split_once("://") {
        return Err(anyhow!("Unsupported storage scheme '{}' in {}", scheme, handle));
    }
    Ok(PathBuf::from(handle))
}

#[async_trait]
impl Storage for LocalStorage {
    async fn download(&self, handle: &str) -> Result<PathBuf> {
        let path = resolve_handle(handle)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(anyhow!("{} does not exist", path.display()));
        }
        Ok(path)
    }

    async fn upload(&self, path: &Path) -> Result<String> {
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("Cannot upload {}: no file name", path.display()))?;
        tokio::fs::create_dir_all(&self.destination).await?;
        let target = self.destination.join(file_name);
        tokio::fs::copy(path, &target)
            .await
            .map_err(|e| anyhow!("Failed to copy {} to {}: {}", path.display(), target.display(), e))?;
        debug!("Uploaded {} to {}", path.display(), target.display());
        let target = std::fs::canonicalize(&target).unwrap_or(target);
        Ok(format!("file://{}", target.display()))
    }
}

/// Runs `op` up to `attempts` times, doubling a short pause between failures. Returns the
/// last error when every attempt fails.
pub async fn with_retries<T, F, Fut>(what: &str, attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut pause = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                tokio::time::sleep(pause).await;
                pause *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{} failed after {} attempt(s)", what, attempts))),
        }
    }
}
