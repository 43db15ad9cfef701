//! Directory-backed credential store
//!
//! Each session owns `<root>/<session id>`. The contents belong to the
//! transport; this store only creates, lists and removes the directories.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::{Error, Result};

/// One credential directory per session id under a common root
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// Create a store rooted at `root` (created lazily)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for a session id
    ///
    /// Ids that could escape the root are rejected.
    pub fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    /// Whether the session has stored credentials
    pub async fn exists(&self, session_id: &str) -> bool {
        match self.path_for(session_id) {
            Ok(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Ensure the session's directory exists and return it
    pub async fn prepare(&self, session_id: &str) -> Result<PathBuf> {
        let path = self.path_for(session_id)?;
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            Error::Credentials(format!("Failed to create {}: {}", path.display(), e))
        })?;
        debug!("Credential directory ready: {}", path.display());
        Ok(path)
    }

    /// Recursively delete the session's directory (missing is fine)
    pub async fn remove(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!("Removed credential directory: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Credentials(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Session ids with a credential directory, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_session_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Session ids are used as directory names
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id != "."
        && session_id != ".."
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("Invalid session id: {:?}", session_id)))
    }
}
