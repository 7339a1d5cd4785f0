//! File-backed local master key for `csfle`.
//!
//! The key file holds the base64 encoding of a 32-byte master key on a
//! single line and must only be readable by its owner. It is suitable for
//! development and testing; production deployments should prefer a remote
//! KMS.

#![warn(clippy::pedantic, clippy::nursery)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use csfle::key_provider::{LocalMasterKey, LOCAL_MASTER_KEY_SIZE};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

/// Errors from reading or creating a key file.
#[derive(Debug, thiserror::Error)]
pub enum KeyFileError {
    /// The key file does not exist
    #[error("key file does not exist: {}", .0.display())]
    NotFound(PathBuf),

    /// `init` refused to overwrite an existing key file
    #[error("key file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// The key file is readable or writable by group or others
    #[error("key file {} has mode {mode:o}, expected 600", .path.display())]
    InsecurePermissions {
        /// Path of the key file
        path: PathBuf,
        /// Permission bits found
        mode: u32,
    },

    /// The file does not hold a valid master key
    #[error("invalid key file: {0}")]
    InvalidKey(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A local master key stored in a file.
///
/// ```text
/// master.key   (base64 of 32 bytes, 0600 permissions)
/// ```
#[derive(Debug, Clone)]
pub struct LocalKeyFile {
    path: PathBuf,
}

impl LocalKeyFile {
    /// Opens an existing key file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path of the key file
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::NotFound` if the file does not exist and
    /// `KeyFileError::InsecurePermissions` if others can read it.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, KeyFileError> {
        let path = path.into();
        if !path.is_file() {
            return Err(KeyFileError::NotFound(path));
        }
        check_permissions(&path)?;
        Ok(Self { path })
    }

    /// Generates a fresh master key and writes it to a new file.
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::AlreadyExists` rather than overwriting a key,
    /// and `KeyFileError::Io` if the file cannot be written.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self, KeyFileError> {
        let path = path.into();

        let mut key = Zeroizing::new([0u8; LOCAL_MASTER_KEY_SIZE]);
        OsRng.fill_bytes(key.as_mut_slice());
        let mut line = Zeroizing::new(STANDARD.encode(key.as_slice()));
        line.push('\n');

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => KeyFileError::AlreadyExists(path.clone()),
            _ => KeyFileError::Io(e),
        })?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;

        tracing::info!(path = %path.display(), "local master key created");
        Ok(Self { path })
    }

    /// Returns the key file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the base64-encoded key, as accepted by
    /// `EngineOptions::with_local_key`.
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::InvalidKey` if the file does not hold base64
    /// of exactly 32 bytes.
    pub fn load_base64(&self) -> Result<SecretString, KeyFileError> {
        let contents = Zeroizing::new(fs::read_to_string(&self.path)?);
        let encoded = contents.trim();
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|e| KeyFileError::InvalidKey(format!("not base64: {e}")))?,
        );
        if decoded.len() != LOCAL_MASTER_KEY_SIZE {
            return Err(KeyFileError::InvalidKey(format!(
                "key is {} bytes, expected {LOCAL_MASTER_KEY_SIZE}",
                decoded.len()
            )));
        }
        Ok(SecretString::new(encoded.to_string()))
    }

    /// Loads the master key.
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::InvalidKey` if the file is malformed.
    pub fn load(&self) -> Result<LocalMasterKey, KeyFileError> {
        let encoded = self.load_base64()?;
        LocalMasterKey::from_base64(encoded.expose_secret()).map_err(|e| KeyFileError::InvalidKey(e.to_string()))
    }
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), KeyFileError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(KeyFileError::InsecurePermissions { path: path.to_path_buf(), mode });
    }
    Ok(())
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
const fn check_permissions(_path: &Path) -> Result<(), KeyFileError> {
    Ok(())
}
