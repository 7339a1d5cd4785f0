//! Engine configuration.
//!
//! Options can be built in code or read from JSON:
//!
//! ```json
//! {
//!   "keyVaultNamespace": "keyvault.datakeys",
//!   "kmsProviders": {
//!     "local": { "key": "<base64 of 32 bytes>" },
//!     "aws": { "accessKeyId": "AKIA...", "secretAccessKey": "..." }
//!   },
//!   "schemaMap": { "test.patients": { "bsonType": "object" } },
//!   "bypassAutoEncryption": false,
//!   "timeoutMs": 10000
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::Error;
use crate::key_provider::{KmsProviders, LocalMasterKey};
use crate::key_vault::split_namespace;
use crate::kms::{AwsCredentials, HttpKmsProvider};
use crate::schema::SchemaMap;
use crate::transport::StreamConnector;

/// Default bound on each network round trip.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Options for [`crate::engine::EncryptionEngine::open`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    /// Key vault collection, as `db.coll`.
    pub key_vault_namespace: Option<String>,
    /// KMS provider credentials.
    #[serde(default)]
    pub kms_providers: KmsProvidersOptions,
    /// Namespace → JSON schema.
    #[serde(default)]
    pub schema_map: HashMap<String, Document>,
    /// Skip auto-encryption; auto-decryption still runs.
    #[serde(default)]
    pub bypass_auto_encryption: bool,
    /// Bound on each markings, key vault and KMS round trip.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// KMS provider section.
#[derive(Debug, Default, Deserialize)]
pub struct KmsProvidersOptions {
    /// Local master key.
    pub local: Option<LocalKmsOptions>,
    /// AWS KMS credentials.
    pub aws: Option<AwsKmsOptions>,
}

/// Local master key, base64-encoded.
#[derive(Deserialize)]
pub struct LocalKmsOptions {
    /// Base64 of the 32-byte master key.
    pub key: SecretString,
}

impl std::fmt::Debug for LocalKmsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKmsOptions").field("key", &"[REDACTED]").finish()
    }
}

/// AWS credentials.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsKmsOptions {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: SecretString,
}

impl std::fmt::Debug for AwsKmsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsKmsOptions")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

impl EngineOptions {
    /// Creates options for a key vault namespace with no KMS provider yet.
    #[must_use]
    pub fn new(key_vault_namespace: impl Into<String>) -> Self {
        Self {
            key_vault_namespace: Some(key_vault_namespace.into()),
            kms_providers: KmsProvidersOptions::default(),
            schema_map: HashMap::new(),
            bypass_auto_encryption: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Parses options from JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` if the JSON does not match.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::ConfigurationError(format!("invalid engine options: {e}")))
    }

    /// Sets the local master key (base64).
    #[must_use]
    pub fn with_local_key(mut self, base64_key: impl Into<String>) -> Self {
        self.kms_providers.local = Some(LocalKmsOptions { key: SecretString::new(base64_key.into()) });
        self
    }

    /// Sets AWS credentials.
    #[must_use]
    pub fn with_aws_credentials(mut self, access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        self.kms_providers.aws = Some(AwsKmsOptions {
            access_key_id: access_key_id.into(),
            secret_access_key: SecretString::new(secret_access_key.into()),
        });
        self
    }

    /// Adds a schema for a namespace.
    #[must_use]
    pub fn with_schema(mut self, namespace: impl Into<String>, schema: Document) -> Self {
        self.schema_map.insert(namespace.into(), schema);
        self
    }

    /// Sets `bypassAutoEncryption`.
    #[must_use]
    pub const fn with_bypass_auto_encryption(mut self, bypass: bool) -> Self {
        self.bypass_auto_encryption = bypass;
        self
    }

    /// Sets the per-round-trip timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the per-round-trip timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Checks the options for completeness.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` naming the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        let namespace = self
            .key_vault_namespace
            .as_deref()
            .ok_or_else(|| Error::ConfigurationError("key vault namespace option required".to_string()))?;
        split_namespace(namespace)?;

        if self.kms_providers.local.is_none() && self.kms_providers.aws.is_none() {
            return Err(Error::ConfigurationError("KMS providers option required".to_string()));
        }
        if let Some(local) = &self.kms_providers.local {
            LocalMasterKey::from_base64(local.key.expose_secret())?;
        }
        if let Some(aws) = &self.kms_providers.aws {
            if aws.access_key_id.is_empty() || aws.secret_access_key.expose_secret().is_empty() {
                return Err(Error::ConfigurationError(
                    "aws KMS provider requires accessKeyId and secretAccessKey".to_string(),
                ));
            }
        }
        if self.timeout_ms == 0 {
            return Err(Error::ConfigurationError("timeoutMs must be positive".to_string()));
        }
        Ok(())
    }

    /// Returns the configured schema map.
    #[must_use]
    pub fn schema_map(&self) -> SchemaMap {
        self.schema_map.iter().map(|(ns, schema)| (ns.clone(), schema.clone())).collect()
    }

    /// Builds the KMS providers; AWS requests go through `connector`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` if the local key is invalid.
    pub fn kms_providers(&self, connector: Arc<dyn StreamConnector>) -> Result<KmsProviders, Error> {
        let mut providers = KmsProviders::new().with_timeout(self.timeout());
        if let Some(local) = &self.kms_providers.local {
            providers = providers.with_local(LocalMasterKey::from_base64(local.key.expose_secret())?);
        }
        if let Some(aws) = &self.kms_providers.aws {
            let credentials = AwsCredentials::new(
                aws.access_key_id.clone(),
                SecretString::new(aws.secret_access_key.expose_secret().clone()),
            );
            providers = providers.with_aws(Arc::new(HttpKmsProvider::with_connector(credentials, connector)));
        }
        Ok(providers)
    }
}
