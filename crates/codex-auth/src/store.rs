//! Token storage for the authentication bundle
//!
//! Manages a single JSON file holding the current `AuthBundle`. All writes
//! use an atomic temp-file + fsync + rename so a crash mid-write leaves
//! either the old bundle or the new one, never a torn file. A tokio Mutex
//! serializes writers (login completion, request-time refresh, background
//! refresh, logout).

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bundle::AuthBundle;
use crate::error::{Error, Result};

/// Thread-safe bundle file manager.
///
/// The in-memory copy is authoritative after `open`; reads clone it under a
/// short lock so request paths never touch the disk.
pub struct TokenStore {
    path: PathBuf,
    state: Mutex<Option<AuthBundle>>,
}

impl TokenStore {
    /// Open the store at `path`, loading the bundle if the file exists.
    ///
    /// A missing file is not an error: the store starts empty and `load`
    /// reports `NotFound` until a login completes.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let bundle: AuthBundle = serde_json::from_str(&contents)
                    .map_err(|e| Error::CredentialParse(format!("parsing auth file: {e}")))?;
                info!(
                    path = %path.display(),
                    account_id = %bundle.token_data.account_id,
                    "loaded auth bundle"
                );
                Some(bundle)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "auth file not found, login required");
                None
            }
            Err(e) => return Err(Error::Io(format!("reading auth file: {e}"))),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the current bundle or `NotFound`.
    pub async fn load(&self) -> Result<AuthBundle> {
        self.current()
            .await
            .ok_or_else(|| Error::NotFound("no authentication bundle stored".into()))
    }

    /// Clone of the current bundle, if any.
    pub async fn current(&self) -> Option<AuthBundle> {
        self.state.lock().await.clone()
    }

    /// Persist `bundle` and make it current, replacing whatever was there.
    pub async fn save(&self, bundle: AuthBundle) -> Result<()> {
        let mut state = self.state.lock().await;
        write_atomic(&self.path, &bundle).await?;
        debug!(account_id = %bundle.token_data.account_id, "saved auth bundle");
        *state = Some(bundle);
        Ok(())
    }

    /// Replace the bundle only if the current one still carries
    /// `expected_refresh_token`.
    ///
    /// Returns `false` (and writes nothing) when the session changed in the
    /// meantime, e.g. a logout or a fresh login raced a refresh.
    pub async fn replace_if_current(
        &self,
        expected_refresh_token: &str,
        bundle: AuthBundle,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let matches = state
            .as_ref()
            .is_some_and(|b| b.token_data.refresh_token == expected_refresh_token);
        if !matches {
            debug!("auth bundle changed during refresh, discarding result");
            return Ok(false);
        }
        write_atomic(&self.path, &bundle).await?;
        *state = Some(bundle);
        Ok(true)
    }

    /// Remove the bundle from memory and disk.
    ///
    /// Returns whether a bundle was present.
    pub async fn clear(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let had_bundle = state.take().is_some();
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(format!("removing auth file: {e}"))),
        }
        if had_bundle {
            info!(path = %self.path.display(), "cleared auth bundle");
        }
        Ok(had_bundle)
    }
}

/// Write the bundle to a file atomically.
///
/// Writes and fsyncs a temporary file in the same directory, then renames it
/// over the target. Permissions are 0600 since the file holds OAuth tokens.
async fn write_atomic(path: &Path, bundle: &AuthBundle) -> Result<()> {
    let json = serde_json::to_vec_pretty(bundle)
        .map_err(|e| Error::CredentialParse(format!("serializing auth bundle: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Io(format!("creating auth directory: {e}")))?;

    let tmp_path = dir.join(format!(".auth.tmp.{}", std::process::id()));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp auth file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting auth file permissions: {e}")))?;
    }

    file.write_all(&json)
        .await
        .map_err(|e| Error::Io(format!("writing temp auth file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp auth file: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp auth file: {e}")))?;

    debug!(path = %path.display(), "persisted auth bundle");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::test_support::bundle;
    use std::sync::Arc;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn missing_file_loads_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("auth.json")).await.unwrap();
        assert!(matches!(store.load().await, Err(Error::NotFound(_))));
        assert!(!dir.path().join("auth.json").exists());
    }

    #[tokio::test]
    async fn roundtrip_save_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");

        let store = TokenStore::open(path.clone()).await.unwrap();
        let saved = bundle("1", HOUR);
        store.save(saved.clone()).await.unwrap();

        let reopened = TokenStore::open(path).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), saved);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let result = TokenStore::open(path).await;
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[tokio::test]
    async fn replace_if_current_rejects_stale_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("auth.json")).await.unwrap();
        store.save(bundle("a", HOUR)).await.unwrap();

        let replaced = store
            .replace_if_current("rt_other", bundle("b", HOUR))
            .await
            .unwrap();
        assert!(!replaced);
        assert_eq!(store.load().await.unwrap().token_data.access_token, "at_a");

        let replaced = store
            .replace_if_current("rt_a", bundle("b", HOUR))
            .await
            .unwrap();
        assert!(replaced);
        assert_eq!(store.load().await.unwrap().token_data.access_token, "at_b");
    }

    #[tokio::test]
    async fn replace_after_clear_does_not_resurrect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        let store = TokenStore::open(path.clone()).await.unwrap();
        store.save(bundle("a", HOUR)).await.unwrap();

        assert!(store.clear().await.unwrap());
        assert!(!path.exists());

        let replaced = store
            .replace_if_current("rt_a", bundle("b", HOUR))
            .await
            .unwrap();
        assert!(!replaced);
        assert!(store.current().await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn clear_on_empty_store_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("auth.json")).await.unwrap();
        assert!(!store.clear().await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        let store = TokenStore::open(path.clone()).await.unwrap();
        store.save(bundle("1", HOUR)).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "auth file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_saves_leave_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        let store = Arc::new(TokenStore::open(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save(bundle(&i.to_string(), HOUR)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let on_disk: AuthBundle = serde_json::from_str(&contents).unwrap();
        assert_eq!(on_disk, store.load().await.unwrap());
    }
}
