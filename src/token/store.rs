//! Credential file persistence
//!
//! Tokens live as one file each in the state directory. Writes go through a
//! temporary file in the same directory followed by a rename, so a reader
//! observes either the old or the new content in full, never a torn write.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

pub const ID_TOKEN_FILE: &str = "id_token.txt";
pub const REFRESH_TOKEN_FILE: &str = "refresh_token.txt";
pub const ACCESS_TOKEN_FILE: &str = "access_token.txt";
pub const DEBUG_RESPONSE_FILE: &str = "token_refresh_response.json";

/// Credential persistence errors
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("credential file missing or empty: {0}")]
    MissingCredential(PathBuf),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A complete token set as returned by the refresh endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub id_token: String,
    pub refresh_token: String,
    pub access_token: String,
}

/// The two credentials needed to boot: the MQTT password and the refresh
/// credential. The access token is persisted but not read back.
#[derive(Debug, Clone)]
pub struct StoredTokens {
    pub id_token: String,
    pub refresh_token: String,
}

/// Reads and writes credential files in the state directory.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Load the boot credentials, trimming surrounding whitespace.
    pub fn load(&self) -> Result<StoredTokens, TokenError> {
        Ok(StoredTokens {
            id_token: self.read_trimmed(ID_TOKEN_FILE)?,
            refresh_token: self.read_trimmed(REFRESH_TOKEN_FILE)?,
        })
    }

    /// Re-read only the refresh credential (it may have been rotated by an
    /// external flow since boot).
    pub fn load_refresh_token(&self) -> Result<String, TokenError> {
        self.read_trimmed(REFRESH_TOKEN_FILE)
    }

    fn read_trimmed(&self, file: &str) -> Result<String, TokenError> {
        let path = self.path(file);
        let content = fs::read_to_string(&path)
            .map_err(|source| TokenError::Io { path: path.clone(), source })?;
        let trimmed = content.trim().to_string();
        if trimmed.is_empty() {
            return Err(TokenError::MissingCredential(path));
        }
        Ok(trimmed)
    }

    /// Persist a full credential set, each file atomically. Any failure
    /// aborts the refresh; previously persisted files keep whichever
    /// version their rename left behind, each internally consistent.
    pub fn persist(&self, set: &CredentialSet) -> Result<(), TokenError> {
        self.write_atomic(ID_TOKEN_FILE, &set.id_token)?;
        self.write_atomic(REFRESH_TOKEN_FILE, &set.refresh_token)?;
        self.write_atomic(ACCESS_TOKEN_FILE, &set.access_token)?;
        debug!(dir = %self.dir.display(), "credential set persisted");
        Ok(())
    }

    /// Write `data` to `file` via tempfile + rename in the same directory,
    /// then fsync the directory so the rename survives a crash.
    fn write_atomic(&self, file: &str, data: &str) -> Result<(), TokenError> {
        let target = self.path(file);
        let io_err = |source| TokenError::Io { path: target.clone(), source };

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(data.as_bytes()).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&target).map_err(|e| io_err(e.error))?;

        let dir_handle = fs::File::open(&self.dir).map_err(io_err)?;
        dir_handle.sync_all().map_err(io_err)?;
        Ok(())
    }

    /// Save the last refresh response for operator debugging. Pretty-printed
    /// when the body is JSON, raw otherwise. Best effort: a failure here is
    /// logged but never fails the refresh.
    pub fn write_debug_response(&self, body: &str) {
        let content = match serde_json::from_str::<serde_json::Value>(body) {
            Ok(json) => format!("{}\n", serde_json::to_string_pretty(&json).unwrap_or_default()),
            Err(_) => body.to_string(),
        };
        let path = self.path(DEBUG_RESPONSE_FILE);
        if let Err(e) = fs::write(&path, content) {
            warn!(path = %path.display(), error = %e, "failed to write refresh debug file");
        }
    }
}
