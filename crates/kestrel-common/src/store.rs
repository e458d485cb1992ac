//! Persistence boundary
//!
//! The engine touches the filesystem only through [`FileStore`]: reading the
//! API model, writing generated artifacts, and persisting the model after a
//! successful mutation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::debug;

use crate::{Error, Result};

/// Filesystem operations the engine performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Whether `path` exists
    async fn exists(&self, path: &Path) -> bool;

    /// Read the whole file
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write `contents`, creating parent directories
    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Write a secret (private key); owner read/write only where supported
    async fn write_private(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Create a directory and its parents
    async fn create_dir_all(&self, path: &Path) -> Result<()>;
}

/// [`FileStore`] over the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore;

impl LocalFileStore {
    pub fn new() -> Self {
        Self
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent.display().to_string(), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| Error::io(path.display().to_string(), e))
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        Self::ensure_parent(path).await?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        debug!(path = %path.display(), bytes = contents.len(), "Saved file");
        Ok(())
    }

    async fn write_private(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.write(path, contents).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| Error::io(path.display().to_string(), e))?;
        }
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| Error::io(path.display().to_string(), e))
    }
}

/// Serialize as pretty JSON with a four-space indent
///
/// Object keys come out in the order `value` yields them; callers wanting a
/// canonical form serialize through `serde_json::Value` first.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    out.push(b'\n');
    Ok(out)
}

/// Canonical JSON: sorted keys, four-space indent
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    to_pretty_json(&value)
}

/// Resolve a relative artifact name against an output directory
pub fn artifact_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_store_round_trips_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalFileStore::new();
        let path = dir.path().join("nested/dir/apimodel.json");

        assert!(!store.exists(&path).await);
        store.write(&path, b"{}").await.expect("write");
        assert!(store.exists(&path).await);
        assert_eq!(store.read(&path).await.expect("read"), b"{}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ca.key");
        LocalFileStore::new()
            .write_private(&path, b"secret")
            .await
            .expect("write");
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = LocalFileStore::new()
            .read(Path::new("/definitely/not/here.json"))
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
    }

    #[test]
    fn canonical_json_sorts_keys_and_indents_four_spaces() {
        let out = to_canonical_json(&json!({"b": 1, "a": {"d": true, "c": [1]}})).expect("json");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(
            text,
            "{\n    \"a\": {\n        \"c\": [\n            1\n        ],\n        \"d\": true\n    },\n    \"b\": 1\n}\n"
        );
    }
}
