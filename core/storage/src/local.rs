//! Local filesystem key-value backend.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::backend::KvBackend;
use jobtrack_common::{Error, Result};

/// Extension of value files.
const VALUE_EXT: &str = "json";

/// Local filesystem backend.
///
/// Stores each key as one file under the root directory; `/` in a key maps
/// to a subdirectory. Writes go to a temporary file first and are renamed
/// into place, so a reader never observes a half-written value.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Create a new file backend with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a key to a filesystem path.
    fn to_fs_path(&self, key: &str) -> Result<PathBuf> {
        let mut fs_path = self.root.clone();
        let mut components = key.split('/').peekable();

        while let Some(component) = components.next() {
            if component.is_empty() || component == "." || component == ".." {
                return Err(Error::InvalidInput(format!("Invalid key: {}", key)));
            }
            if components.peek().is_some() {
                fs_path.push(component);
            } else {
                fs_path.push(format!("{}.{}", component, VALUE_EXT));
            }
        }

        Ok(fs_path)
    }

    /// Convert a value file path back to its key.
    fn to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        if relative.extension()?.to_str()? != VALUE_EXT {
            return None;
        }
        let without_ext = relative.with_extension("");
        let parts: Vec<&str> = without_ext
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    fn ensure_root(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(Error::Storage(format!(
                "Storage root missing: {}",
                self.root.display()
            )))
        }
    }
}

#[async_trait]
impl KvBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn is_available(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_root()?;
        let fs_path = self.to_fs_path(key)?;

        match fs::read_to_string(&fs_path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.ensure_root()?;
        let fs_path = self.to_fs_path(key)?;

        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = fs_path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&tmp_path, value.as_bytes()).await?;
        if let Err(e) = fs::rename(&tmp_path, &fs_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::Io(e));
        }

        debug!("Wrote {} to {}", key, fs_path.display());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.ensure_root()?;
        let fs_path = self.to_fs_path(key)?;

        match fs::remove_file(&fs_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_root()?;
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.to_key(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (FileBackend, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path()).unwrap();
        (backend, temp_dir)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (backend, _temp) = setup().await;

        backend
            .set("record/applications/r1", "{\"a\":1}".to_string())
            .await
            .unwrap();

        let value = backend.get("record/applications/r1").await.unwrap();
        assert_eq!(value.as_deref(), Some("{\"a\":1}"));
        assert!(backend.get("record/applications/r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (backend, _temp) = setup().await;

        backend.set("meta/last_write", "1".to_string()).await.unwrap();
        backend.set("meta/last_write", "2".to_string()).await.unwrap();

        assert_eq!(
            backend.get("meta/last_write").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_list_keys() {
        let (backend, _temp) = setup().await;

        backend.set("record/applications/r1", "x".to_string()).await.unwrap();
        backend.set("record/contacts/c1", "x".to_string()).await.unwrap();
        backend.set("meta/last_write", "x".to_string()).await.unwrap();

        let keys = backend.list_keys("record/").await.unwrap();
        assert_eq!(keys, vec!["record/applications/r1", "record/contacts/c1"]);
    }

    #[tokio::test]
    async fn test_remove() {
        let (backend, _temp) = setup().await;

        backend.set("record/applications/r1", "x".to_string()).await.unwrap();
        backend.remove("record/applications/r1").await.unwrap();
        backend.remove("record/applications/r1").await.unwrap();

        assert!(backend.get("record/applications/r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_key() {
        let (backend, _temp) = setup().await;
        assert!(backend.set("../escape", "x".to_string()).await.is_err());
        assert!(backend.set("a//b", "x".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_when_root_removed() {
        let (backend, temp) = setup().await;
        assert!(backend.is_available().await);

        std::fs::remove_dir_all(temp.path()).unwrap();
        assert!(!backend.is_available().await);
        assert!(backend.set("a", "x".to_string()).await.is_err());
    }
}
