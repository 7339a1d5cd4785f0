//! AWS SDK backed KMS provider for `csfle`.
//!
//! A drop-in replacement for the engine's built-in KMS client that goes
//! through the official `aws-sdk-kms` client, picking up the SDK's
//! credential chain, retries and TLS stack.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use csfle::prelude::*;
//! use csfle_kms_aws::AwsSdkKmsProvider;
//!
//! # async fn example(options: EngineOptions, runner: Arc<dyn CommandRunner>) -> Result<(), Error> {
//! let provider = AwsSdkKmsProvider::from_env().await;
//! let engine = EncryptionEngine::builder(options)
//!     .key_vault(runner.clone())
//!     .markings(runner)
//!     .aws_provider(Arc::new(provider))
//!     .open()?;
//! # Ok(())
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! The provider uses the AWS SDK's default credential chain:
//! - Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//! - AWS credentials file (`~/.aws/credentials`)
//! - IAM instance profile, ECS task role, web identity token
//!
//! The region and endpoint always come from the data key's master key, not
//! from the environment.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_kms::config::Region;
use aws_sdk_kms::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use csfle::data_key::AwsMasterKey;
use csfle::error::KmsError;
use csfle::kdf::DATA_KEY_SIZE;
use csfle::key_provider::KmsProvider;
use secrecy::{ExposeSecret, SecretVec};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Error codes that mean the request was rejected for its credentials.
const AUTH_ERROR_CODES: &[&str] = &[
    "UnrecognizedClientException",
    "InvalidSignatureException",
    "IncompleteSignatureException",
    "AccessDeniedException",
    "MissingAuthenticationTokenException",
    "ExpiredTokenException",
];

/// Which operation failed; picks the fallback error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Encrypt,
    Decrypt,
}

/// KMS provider backed by the AWS SDK.
///
/// One SDK client is built per `(region, endpoint)` pair and reused.
pub struct AwsSdkKmsProvider {
    sdk_config: aws_config::SdkConfig,
    clients: RwLock<HashMap<(String, Option<String>), KmsClient>>,
}

impl AwsSdkKmsProvider {
    /// Creates a provider from the default AWS environment.
    pub async fn from_env() -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
        Self::new(sdk_config)
    }

    /// Creates a provider from an explicit SDK configuration.
    #[must_use]
    pub fn new(sdk_config: aws_config::SdkConfig) -> Self {
        Self { sdk_config, clients: RwLock::new(HashMap::new()) }
    }

    async fn client(&self, master_key: &AwsMasterKey) -> KmsClient {
        let cache_key = (master_key.region.clone(), master_key.endpoint.clone());
        if let Some(client) = self.clients.read().await.get(&cache_key) {
            return client.clone();
        }

        let mut builder =
            aws_sdk_kms::config::Builder::from(&self.sdk_config).region(Region::new(master_key.region.clone()));
        if let Some(endpoint) = &master_key.endpoint {
            builder = builder.endpoint_url(endpoint_url(endpoint));
        }
        let client = KmsClient::from_conf(builder.build());

        tracing::debug!(region = %master_key.region, endpoint = %master_key.endpoint(), "built KMS client");
        self.clients.write().await.entry(cache_key).or_insert(client).clone()
    }
}

impl std::fmt::Debug for AwsSdkKmsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSdkKmsProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl KmsProvider for AwsSdkKmsProvider {
    async fn wrap_dek(&self, master_key: &AwsMasterKey, dek: &SecretVec<u8>) -> Result<Vec<u8>, KmsError> {
        let response = self
            .client(master_key)
            .await
            .encrypt()
            .key_id(&master_key.key)
            .plaintext(Blob::new(dek.expose_secret().clone()))
            .send()
            .await
            .map_err(|e| classify(&e, Action::Encrypt))?;

        let blob = response
            .ciphertext_blob()
            .ok_or_else(|| KmsError::WrapFailed("no CiphertextBlob returned".to_string()))?;
        Ok(blob.as_ref().to_vec())
    }

    async fn unwrap_dek(&self, master_key: &AwsMasterKey, wrapped_dek: &[u8]) -> Result<SecretVec<u8>, KmsError> {
        let response = self
            .client(master_key)
            .await
            .decrypt()
            .key_id(&master_key.key)
            .ciphertext_blob(Blob::new(wrapped_dek.to_vec()))
            .send()
            .await
            .map_err(|e| classify(&e, Action::Decrypt))?;

        check_key_id(master_key, response.key_id())?;
        let plaintext = Zeroizing::new(
            response
                .plaintext()
                .ok_or_else(|| KmsError::UnwrapFailed("no Plaintext returned".to_string()))?
                .as_ref()
                .to_vec(),
        );
        if plaintext.len() != DATA_KEY_SIZE {
            return Err(KmsError::UnwrapFailed(format!(
                "KMS returned {} bytes of plaintext, expected {DATA_KEY_SIZE}",
                plaintext.len()
            )));
        }
        Ok(SecretVec::new(plaintext.to_vec()))
    }
}

/// Turns an endpoint override into a URL the SDK accepts.
fn endpoint_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

/// The returned key id must match when the master key is a full ARN.
fn check_key_id(master_key: &AwsMasterKey, returned: Option<&str>) -> Result<(), KmsError> {
    if !master_key.key.starts_with("arn:") {
        return Ok(());
    }
    match returned {
        Some(id) if id == master_key.key => Ok(()),
        Some(id) => Err(KmsError::UnwrapFailed(format!("KMS answered for key {id}, expected {}", master_key.key))),
        None => Err(KmsError::UnwrapFailed("KMS response has no KeyId".to_string())),
    }
}

fn classify<E, R>(err: &SdkError<E, R>, action: Action) -> KmsError
where
    E: ProvideErrorMetadata,
{
    let transport = matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_));
    failure(transport, err.code(), err.to_string(), action)
}

fn failure(transport: bool, code: Option<&str>, message: String, action: Action) -> KmsError {
    if transport {
        return KmsError::Unreachable(message);
    }
    if code.is_some_and(|c| AUTH_ERROR_CODES.contains(&c)) {
        return KmsError::AuthFailed(format!("{}: {message}", code.unwrap_or_default()));
    }
    match action {
        Action::Encrypt => KmsError::WrapFailed(message),
        Action::Decrypt => KmsError::UnwrapFailed(message),
    }
}
