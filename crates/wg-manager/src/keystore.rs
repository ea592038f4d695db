//! Loading key material referenced by file.

use std::future::Future;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::codec::{self, KEY_SIZE};
use crate::error::KeyStoreError;

/// Directory key file references are resolved against by default.
pub const DEFAULT_KEY_ROOT: &str = "/etc/wireguard";

/// Source of key material for [`KeySource::File`](crate::KeySource::File)
/// references.
pub trait KeyStore: Send + Sync {
    /// Loads and decodes the key stored at `path`.
    fn load(
        &self,
        path: &Path,
    ) -> impl Future<Output = Result<[u8; KEY_SIZE], KeyStoreError>> + Send;
}

/// Reads key files from a root directory.
///
/// Relative references are joined to the root. Absolute references must
/// already lie under it, and `..` components are never followed.
#[derive(Clone, Debug)]
pub struct FsKeyStore {
    root: PathBuf,
}

impl FsKeyStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a reference to the file that would be read.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::OutsideRoot`] if the reference escapes the
    /// root.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, KeyStoreError> {
        let outside = || KeyStoreError::OutsideRoot {
            path: path.to_path_buf(),
            root: self.root.clone(),
        };

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(outside());
        }

        if path.is_absolute() {
            if path.starts_with(&self.root) {
                Ok(path.to_path_buf())
            } else {
                Err(outside())
            }
        } else {
            Ok(self.root.join(path))
        }
    }
}

impl Default for FsKeyStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_ROOT)
    }
}

impl KeyStore for FsKeyStore {
    async fn load(&self, path: &Path) -> Result<[u8; KEY_SIZE], KeyStoreError> {
        let resolved = self.resolve(path)?;
        debug!(path = %resolved.display(), "loading key file");

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| KeyStoreError::Read {
                path: resolved.clone(),
                message: e.to_string(),
            })?;

        codec::decode(content.trim()).map_err(|e| KeyStoreError::Decode {
            path: resolved,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: &str = "GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kc=";

    fn store_with(name: &str, content: &str) -> (TempDir, FsKeyStore) {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join(name), content).expect("write key");
        let store = FsKeyStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn loads_relative_reference() {
        let (_dir, store) = store_with("wg0.key", KEY);
        let key = store.load(Path::new("wg0.key")).await.expect("load");
        assert_eq!(codec::encode(&key), KEY);
    }

    #[tokio::test]
    async fn trims_trailing_newline() {
        let (_dir, store) = store_with("wg0.key", &format!("  {KEY}\n"));
        assert!(store.load(Path::new("wg0.key")).await.is_ok());
    }

    #[tokio::test]
    async fn loads_absolute_reference_under_root() {
        let (dir, store) = store_with("wg0.key", KEY);
        let absolute = dir.path().join("wg0.key");
        assert!(store.load(&absolute).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_parent_components() {
        let (_dir, store) = store_with("wg0.key", KEY);
        let err = store
            .load(Path::new("../etc/shadow"))
            .await
            .expect_err("escape");
        assert!(matches!(err, KeyStoreError::OutsideRoot { .. }));
    }

    #[tokio::test]
    async fn rejects_absolute_outside_root() {
        let (_dir, store) = store_with("wg0.key", KEY);
        let err = store
            .load(Path::new("/etc/passwd"))
            .await
            .expect_err("outside");
        assert!(matches!(err, KeyStoreError::OutsideRoot { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_read_error() {
        let (_dir, store) = store_with("wg0.key", KEY);
        let err = store.load(Path::new("nope.key")).await.expect_err("missing");
        assert!(matches!(err, KeyStoreError::Read { .. }));
    }

    #[tokio::test]
    async fn bad_content_is_decode_error() {
        let (_dir, store) = store_with("wg0.key", "not a key");
        let err = store.load(Path::new("wg0.key")).await.expect_err("garbage");
        assert!(matches!(err, KeyStoreError::Decode { .. }));
    }

    #[test]
    fn default_root_is_etc_wireguard() {
        assert_eq!(FsKeyStore::default().root(), Path::new(DEFAULT_KEY_ROOT));
    }
}
