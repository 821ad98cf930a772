//! Blob Store
//!
//! Durable, path-addressed storage for dataset archives, extracted shard files and
//! reports. Blobs are immutable once written; the pipeline only ever overwrites a
//! blob with identical content (redelivered uploads).
//!
//! Two backends: [`MemoryBlobStore`] for single-process deployments and tests,
//! [`FileBlobStore`] for a shared directory (e.g. a mounted volume).

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns `None` when nothing is stored at `path`.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, path: &str, content: Vec<u8>) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Lists stored paths starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deletes every blob under `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Logical blob layout.
pub mod paths {
    pub fn inbound_archive(referential: &str, run_id: &str) -> String {
        format!("inbound/{}/{}.zip", referential, run_id)
    }

    pub fn work_dir(referential: &str, run_id: &str) -> String {
        format!("work/{}/{}/", referential, run_id)
    }

    pub fn shard(referential: &str, run_id: &str, shard_name: &str) -> String {
        format!("work/{}/{}/{}", referential, run_id, shard_name)
    }

    pub fn shard_report(referential: &str, run_id: &str, shard_name: &str) -> String {
        format!("work/{}/{}/{}.report.json", referential, run_id, shard_name)
    }

    pub fn schema_report(referential: &str, run_id: &str, shard_name: &str) -> String {
        format!(
            "work/{}/{}/{}.schema-report.json",
            referential, run_id, shard_name
        )
    }

    pub fn dataset_report(referential: &str, run_id: &str) -> String {
        format!("work/{}/{}/dataset-report.json", referential, run_id)
    }

    pub fn final_report(referential: &str, run_id: &str) -> String {
        format!("reports/{}/report-{}.json", referential, run_id)
    }

    /// Zero-byte marker written once the terminal status notification has been sent.
    pub fn status_marker(referential: &str, run_id: &str) -> String {
        format!("reports/{}/report-{}.json.status", referential, run_id)
    }
}

// --- In-memory backend ---

pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(path).map(|blob| blob.value().clone()))
    }

    async fn put(&self, path: &str, content: Vec<u8>) -> Result<()> {
        tracing::trace!("Stored blob {} ({} bytes)", path, content.len());
        self.blobs.insert(path.to_string(), content);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .blobs
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let before = self.blobs.len();
        self.blobs.retain(|path, _| !path.starts_with(prefix));
        Ok(before.saturating_sub(self.blobs.len()))
    }
}

// --- Filesystem backend ---

pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps a logical path below the root, refusing anything that could escape it.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(anyhow::anyhow!("Invalid blob path: {}", path));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full_path = self.resolve(path)?;
        match tokio::fs::read(&full_path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read blob {}", path)),
        }
    }

    async fn put(&self, path: &str, content: Vec<u8>) -> Result<()> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so readers never observe a partial blob.
        let temp_path = full_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&temp_path, content)
            .await
            .with_context(|| format!("Failed to write blob {}", path))?;
        tokio::fs::rename(&temp_path, &full_path).await?;

        tracing::trace!("Stored blob {}", path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full_path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let mut paths = tokio::task::spawn_blocking(move || walk_files(&root)).await??;
        paths.retain(|path| path.starts_with(&prefix));
        paths.sort();
        Ok(paths)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let paths = self.list(prefix).await?;
        let mut removed = 0;
        for path in paths {
            match tokio::fs::remove_file(self.resolve(&path)?).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

/// Collects every file below `root` as a `/`-separated path relative to it.
fn walk_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                let logical: Vec<String> = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(logical.join("/"));
            }
        }
    }

    Ok(files)
}
