//! KMS providers: wrap and unwrap data keys with a master key.
//!
//! The `local` provider holds a 32-byte master key in process and wraps data
//! keys with ChaCha20-Poly1305. Remote providers implement [`KmsProvider`]
//! and are reached over the network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bson::Uuid;
use chacha20poly1305::aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use secrecy::{ExposeSecret, Secret, SecretVec};

use crate::data_key::{AwsMasterKey, DataKey, MasterKey};
use crate::error::{Error, KmsError};
use crate::kdf::DATA_KEY_SIZE;
use crate::keyring::ResolvedKey;

/// Size of the local master key in bytes.
pub const LOCAL_MASTER_KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// Remote key management service.
///
/// Implementations must be thread-safe (`Send + Sync`): unwraps for one
/// operation are dispatched concurrently.
#[async_trait]
pub trait KmsProvider: Send + Sync {
    /// Wraps a fresh data key under the given master key.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::WrapFailed` if the KMS does not return ciphertext.
    async fn wrap_dek(&self, master_key: &AwsMasterKey, dek: &SecretVec<u8>) -> Result<Vec<u8>, KmsError>;

    /// Unwraps a data key.
    ///
    /// # Arguments
    ///
    /// * `master_key` - Master key parameters stored with the data key
    /// * `wrapped_dek` - The `keyMaterial` of the data key document
    ///
    /// # Errors
    ///
    /// - `KmsError::Unreachable` if the endpoint cannot be reached
    /// - `KmsError::AuthFailed` if the request is rejected for credentials
    /// - `KmsError::UnwrapFailed` for any other failure or invalid response
    async fn unwrap_dek(
        &self,
        master_key: &AwsMasterKey,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KmsError>;
}

/// The process-held local master key.
pub struct LocalMasterKey {
    key: Secret<[u8; LOCAL_MASTER_KEY_SIZE]>,
}

impl LocalMasterKey {
    /// Creates a local master key from raw bytes.
    #[must_use]
    pub fn new(key: [u8; LOCAL_MASTER_KEY_SIZE]) -> Self {
        Self { key: Secret::new(key) }
    }

    /// Creates a local master key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` if the slice is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let key: [u8; LOCAL_MASTER_KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::ConfigurationError(format!(
                "local master key must be {LOCAL_MASTER_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    /// Creates a local master key from its base64 encoding.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` if the string is not valid base64
    /// of 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = zeroize::Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::ConfigurationError(format!("local master key is not base64: {e}")))?,
        );
        Self::from_slice(&bytes)
    }

    /// Wraps a data key. Output layout: `nonce(12) || ciphertext || tag(16)`.
    ///
    /// The key id is bound as associated data.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnwrapFailed` if encryption fails.
    pub fn wrap_dek(&self, dek: &SecretVec<u8>, key_id: Uuid) -> Result<Vec<u8>, Error> {
        let cipher = ChaCha20Poly1305::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::UnwrapFailed(format!("invalid local master key: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: dek.expose_secret(), aad: &key_id.bytes() })
            .map_err(|e| Error::UnwrapFailed(format!("local key wrap failed: {e}")))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    /// Unwraps a data key produced by [`Self::wrap_dek`].
    ///
    /// # Errors
    ///
    /// Returns `Error::UnwrapFailed` if the material is truncated, was
    /// wrapped under another master key or key id, or is not 32 bytes.
    pub fn unwrap_dek(&self, wrapped: &[u8], key_id: Uuid) -> Result<SecretVec<u8>, Error> {
        if wrapped.len() < NONCE_SIZE {
            return Err(Error::UnwrapFailed("wrapped key material too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);

        let cipher = ChaCha20Poly1305::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::UnwrapFailed(format!("invalid local master key: {e}")))?;

        let dek = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: ciphertext, aad: &key_id.bytes() })
            .map_err(|_| Error::UnwrapFailed("local master key did not authenticate key material".to_string()))?;

        if dek.len() != DATA_KEY_SIZE {
            return Err(Error::UnwrapFailed(format!(
                "unwrapped key is {} bytes, expected {DATA_KEY_SIZE}",
                dek.len()
            )));
        }
        Ok(SecretVec::new(dek))
    }
}

impl std::fmt::Debug for LocalMasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalMasterKey([REDACTED])")
    }
}

/// The configured KMS providers.
#[derive(Clone, Default)]
pub struct KmsProviders {
    local: Option<Arc<LocalMasterKey>>,
    aws: Option<Arc<dyn KmsProvider>>,
    timeout: Option<Duration>,
}

impl KmsProviders {
    /// Creates an empty provider set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the local master key.
    #[must_use]
    pub fn with_local(mut self, key: LocalMasterKey) -> Self {
        self.local = Some(Arc::new(key));
        self
    }

    /// Sets the provider used for `aws` master keys.
    #[must_use]
    pub fn with_aws(mut self, provider: Arc<dyn KmsProvider>) -> Self {
        self.aws = Some(provider);
        self
    }

    /// Bounds each remote round trip.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns true if no provider is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.local.is_none() && self.aws.is_none()
    }

    /// Returns true if a local master key is configured.
    #[must_use]
    pub const fn has_local(&self) -> bool {
        self.local.is_some()
    }

    /// Returns true if an `aws` provider is configured.
    #[must_use]
    pub const fn has_aws(&self) -> bool {
        self.aws.is_some()
    }

    fn local(&self) -> Result<&LocalMasterKey, Error> {
        self.local
            .as_deref()
            .ok_or_else(|| Error::ConfigurationError("no local master key configured".to_string()))
    }

    fn aws(&self) -> Result<&dyn KmsProvider, Error> {
        self.aws
            .as_deref()
            .ok_or_else(|| Error::ConfigurationError("no aws KMS provider configured".to_string()))
    }

    /// Wraps a new data key under `master_key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` if the provider is not configured
    /// and KMS errors (`KmsUnreachable`, `KmsAuthFailed`, `UnwrapFailed`)
    /// for failed remote wraps.
    pub async fn wrap(&self, master_key: &MasterKey, dek: &SecretVec<u8>, key_id: Uuid) -> Result<Vec<u8>, Error> {
        match master_key {
            MasterKey::Local => self.local()?.wrap_dek(dek, key_id),
            MasterKey::Aws(aws) => {
                let provider = self.aws()?;
                tracing::debug!(endpoint = %aws.endpoint(), "wrapping data key with remote KMS");
                Ok(self.bounded(aws, provider.wrap_dek(aws, dek)).await??)
            }
        }
    }

    /// Unwraps a data key into a resolved key.
    ///
    /// `local` keys are unwrapped in process; `aws` keys make one request to
    /// the remote KMS.
    ///
    /// # Errors
    ///
    /// Returns `Error::KmsUnreachable`, `Error::KmsAuthFailed` or
    /// `Error::UnwrapFailed`, and `Error::ConfigurationError` if the key's
    /// provider is not configured.
    pub async fn unwrap(&self, data_key: &DataKey) -> Result<ResolvedKey, Error> {
        let material = match data_key.master_key() {
            MasterKey::Local => self.local()?.unwrap_dek(data_key.key_material(), data_key.id())?,
            MasterKey::Aws(aws) => {
                let provider = self.aws()?;
                tracing::debug!(key_id = %data_key.id(), endpoint = %aws.endpoint(), "unwrapping data key with remote KMS");
                self.bounded(aws, provider.unwrap_dek(aws, data_key.key_material())).await??
            }
        };
        ResolvedKey::from_secret(data_key.id(), &material)
    }

    async fn bounded<T>(
        &self,
        master_key: &AwsMasterKey,
        fut: impl std::future::Future<Output = Result<T, KmsError>> + Send,
    ) -> Result<Result<T, KmsError>, Error> {
        match self.timeout {
            None => Ok(fut.await),
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                Error::KmsUnreachable(format!(
                    "no response from {} within {}ms",
                    master_key.endpoint(),
                    limit.as_millis()
                ))
            }),
        }
    }
}

impl std::fmt::Debug for KmsProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsProviders")
            .field("local", &self.has_local())
            .field("aws", &self.has_aws())
            .field("timeout", &self.timeout)
            .finish()
    }
}
