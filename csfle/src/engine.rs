//! The encryption engine: owns the collaborators and drives contexts.
//!
//! # Example
//!
//! ```rust,ignore
//! use csfle::prelude::*;
//!
//! let engine = EncryptionEngine::builder(options)
//!     .key_vault(key_vault_runner)
//!     .markings(markings_runner)
//!     .open()?;
//!
//! let command = engine.auto_encrypt("test", command).await?;
//! let reply = engine.auto_decrypt("test", reply).await?;
//! engine.close();
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use bson::{Binary, Bson, Document, Uuid};
use futures_util::future::try_join_all;
use zeroize::Zeroizing;

use crate::cipher::{encrypt_field, generate_iv, wrap_value};
use crate::config::EngineOptions;
use crate::context::{AutoEncryptionContext, Operation, State};
use crate::data_key::{Algorithm, DataKey, KeyRef, MasterKey, ProviderKind};
use crate::envelope::{build_envelope, EncryptedEnvelope, Marking};
use crate::error::Error;
use crate::kdf::generate_data_key;
use crate::key_provider::{KmsProvider, KmsProviders};
use crate::key_vault::KeyVault;
use crate::pool::RunnerPool;
use crate::schema::{MarkingsClient, SchemaResolver};
use crate::transport::{CommandRunner, StreamConnector, TcpConnector};
use crate::walker::{collect, transform, DecryptVisitor, EncryptVisitor, TransformMode};

/// Builds an [`EncryptionEngine`] from options and collaborator channels.
pub struct EngineBuilder {
    options: EngineOptions,
    key_vault: Option<Arc<RunnerPool>>,
    markings: Option<Arc<RunnerPool>>,
    collinfo: Option<Arc<RunnerPool>>,
    connector: Arc<dyn StreamConnector>,
    aws_provider: Option<Arc<dyn KmsProvider>>,
}

impl EngineBuilder {
    /// Sets the channel used for key vault queries and inserts.
    #[must_use]
    pub fn key_vault(self, runner: Arc<dyn CommandRunner>) -> Self {
        self.key_vault_pool(Arc::new(RunnerPool::single(runner)))
    }

    /// Sets a pool of key vault channels.
    #[must_use]
    pub fn key_vault_pool(mut self, pool: Arc<RunnerPool>) -> Self {
        self.key_vault = Some(pool);
        self
    }

    /// Sets the channel to the markings service.
    #[must_use]
    pub fn markings(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.markings = Some(Arc::new(RunnerPool::single(runner)));
        self
    }

    /// Sets the channel used to read collection validators when the schema
    /// map has no entry for a namespace.
    #[must_use]
    pub fn collection_info(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.collinfo = Some(Arc::new(RunnerPool::single(runner)));
        self
    }

    /// Sets the connector used by the built-in AWS KMS client.
    #[must_use]
    pub fn kms_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replaces the built-in AWS KMS client.
    #[must_use]
    pub fn aws_provider(mut self, provider: Arc<dyn KmsProvider>) -> Self {
        self.aws_provider = Some(provider);
        self
    }

    /// Validates the options and opens the engine.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` if the options are invalid, the
    /// key vault channel is missing, or auto-encryption is enabled without a
    /// markings channel.
    pub fn open(self) -> Result<EncryptionEngine, Error> {
        self.options.validate()?;

        let key_vault_pool = self
            .key_vault
            .ok_or_else(|| Error::ConfigurationError("key vault channel required".to_string()))?;
        if self.markings.is_none() && !self.options.bypass_auto_encryption {
            return Err(Error::ConfigurationError(
                "markings service channel required unless bypassAutoEncryption is set".to_string(),
            ));
        }

        let timeout = self.options.timeout();
        let namespace = self
            .options
            .key_vault_namespace
            .as_deref()
            .ok_or_else(|| Error::ConfigurationError("key vault namespace option required".to_string()))?;
        let key_vault = KeyVault::new(key_vault_pool, namespace, timeout)?;

        let mut providers = self.options.kms_providers(self.connector)?;
        if let Some(provider) = self.aws_provider {
            providers = providers.with_aws(provider);
        }

        let schemas = SchemaResolver::new(self.options.schema_map(), self.collinfo, timeout);
        let markings = self.markings.map(|pool| MarkingsClient::new(pool, timeout));

        tracing::info!(
            key_vault = %key_vault.namespace(),
            schemas = schemas.local().len(),
            bypass_auto_encryption = self.options.bypass_auto_encryption,
            timeout_ms = self.options.timeout_ms,
            "encryption engine opened"
        );

        Ok(EncryptionEngine {
            key_vault,
            schemas,
            markings,
            providers,
            bypass_auto_encryption: self.options.bypass_auto_encryption,
        })
    }
}

/// Client-side field-level encryption engine.
///
/// The engine is `Send + Sync`; share it behind an `Arc`. Each call runs in
/// its own [`AutoEncryptionContext`], so concurrent calls share nothing but
/// the collaborator channels.
#[derive(Debug)]
pub struct EncryptionEngine {
    key_vault: KeyVault,
    schemas: SchemaResolver,
    markings: Option<MarkingsClient>,
    providers: KmsProviders,
    bypass_auto_encryption: bool,
}

impl EncryptionEngine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder(options: EngineOptions) -> EngineBuilder {
        EngineBuilder {
            options,
            key_vault: None,
            markings: None,
            collinfo: None,
            connector: Arc::new(TcpConnector),
            aws_provider: None,
        }
    }

    /// Closes the engine, releasing every collaborator channel.
    pub fn close(self) {
        tracing::info!(key_vault = %self.key_vault.namespace(), "encryption engine closed");
    }

    /// Returns true if auto-encryption is bypassed.
    #[must_use]
    pub const fn bypass_auto_encryption(&self) -> bool {
        self.bypass_auto_encryption
    }

    /// Encrypts the fields of `command` that its namespace's schema marks.
    ///
    /// Commands without a schema, or without a collection, come back
    /// unchanged without any key vault or KMS traffic.
    ///
    /// # Errors
    ///
    /// Returns the first error of any phase; no partially encrypted command
    /// is ever returned.
    pub async fn auto_encrypt(&self, db: &str, command: Document) -> Result<Document, Error> {
        if self.bypass_auto_encryption {
            tracing::debug!(%db, "auto-encryption bypassed");
            return Ok(command);
        }
        let mut ctx = AutoEncryptionContext::encrypt(db, command);
        self.run(&mut ctx).await;
        ctx.into_result()
    }

    /// Decrypts every encrypted value in `reply`.
    ///
    /// # Errors
    ///
    /// Returns the first error; `Error::AuthenticationFailed` if any envelope
    /// fails to verify.
    pub async fn auto_decrypt(&self, db: &str, reply: Document) -> Result<Document, Error> {
        let mut ctx = AutoEncryptionContext::decrypt(db, reply);
        self.run(&mut ctx).await;
        ctx.into_result()
    }

    /// Encrypts one value and returns the envelope as a binary value.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if the key does not exist, and KMS or
    /// cipher errors from resolving the key and encrypting.
    pub async fn explicit_encrypt(&self, value: Bson, key_ref: KeyRef, algorithm: Algorithm) -> Result<Bson, Error> {
        let mut ctx = AutoEncryptionContext::explicit_encrypt(value, key_ref, algorithm);
        self.run(&mut ctx).await;
        take_value(ctx.into_result()?)
    }

    /// Decrypts one envelope value.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `value` is not an encrypted binary,
    /// and the decode, key or authentication errors of decryption.
    pub async fn explicit_decrypt(&self, value: Bson) -> Result<Bson, Error> {
        let mut ctx = AutoEncryptionContext::explicit_decrypt(value);
        self.run(&mut ctx).await;
        take_value(ctx.into_result()?)
    }

    /// Creates a data key wrapped under `master_key` and stores it in the
    /// key vault.
    ///
    /// # Arguments
    ///
    /// * `master_key` - Master key that wraps the new data key
    /// * `alt_names` - Alternate names; each must be non-empty and unique
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` for empty or duplicate alternate names
    /// - KMS errors if wrapping fails
    /// - `Error::KeyVaultQueryFailed` if the insert fails
    pub async fn create_data_key(&self, master_key: MasterKey, alt_names: Vec<String>) -> Result<Uuid, Error> {
        let mut seen = HashSet::new();
        for name in &alt_names {
            if name.is_empty() {
                return Err(Error::InvalidArgument("keyAltNames must not contain empty names".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidArgument(format!("duplicate keyAltName '{name}'")));
            }
        }

        let id = Uuid::new();
        let dek = generate_data_key();
        let wrapped = self.providers.wrap(&master_key, &dek, id).await?;
        let data_key = DataKey::new(id, wrapped, master_key, alt_names);
        self.key_vault.insert(&data_key).await?;

        tracing::info!(key_id = %id, provider = data_key.master_key().provider(), "data key created");
        Ok(id)
    }

    /// Drives `ctx` until it reaches `Done` or `Error`.
    pub async fn run(&self, ctx: &mut AutoEncryptionContext) {
        while !ctx.state().is_terminal() {
            if let Err(error) = self.step(ctx).await {
                tracing::warn!(state = %ctx.state(), %error, "operation failed");
                ctx.fail(error);
            }
        }
    }

    async fn step(&self, ctx: &mut AutoEncryptionContext) -> Result<(), Error> {
        match ctx.state() {
            State::Init => start(ctx),
            State::NeedSchema => self.fetch_schema(ctx).await,
            State::NeedMarkings => self.fetch_markings(ctx).await,
            State::NeedKeyLookup => self.lookup_keys(ctx).await,
            State::NeedKms => self.unwrap_remote_keys(ctx).await,
            State::Ready => finalize(ctx),
            State::Done | State::Error => Ok(()),
        }
    }

    async fn fetch_schema(&self, ctx: &mut AutoEncryptionContext) -> Result<(), Error> {
        let schema = match ctx.namespace() {
            Some(namespace) => self.schemas.resolve(namespace).await?,
            None => None,
        };
        match schema {
            Some(schema) => {
                ctx.schema = Some(schema);
                ctx.advance(State::NeedMarkings);
            }
            None => {
                tracing::debug!(namespace = ?ctx.namespace(), "no schema, command sent as-is");
                let command = std::mem::take(&mut ctx.pending);
                ctx.finish(command);
            }
        }
        Ok(())
    }

    async fn fetch_markings(&self, ctx: &mut AutoEncryptionContext) -> Result<(), Error> {
        let markings = self
            .markings
            .as_ref()
            .ok_or_else(|| Error::MarkingsServiceFailed("no markings service configured".to_string()))?;
        let schema = ctx
            .schema
            .take()
            .ok_or_else(|| Error::MarkingsServiceFailed("no schema resolved".to_string()))?;

        let mut marked = markings.mark(&ctx.pending, &schema).await?;
        if let Some(db) = ctx.pending.get("$db") {
            if !marked.contains_key("$db") {
                marked.insert("$db", db.clone());
            }
        }

        let mut refs = Vec::new();
        collect(&marked, TransformMode::MarkingsToEncrypted, &mut |leaf: &Binary| {
            push_unique(&mut refs, Marking::from_binary(leaf)?.key_ref().clone());
            Ok(())
        })?;
        tracing::debug!(namespace = ?ctx.namespace(), keys = refs.len(), "command marked");

        ctx.key_refs = refs;
        ctx.pending = marked;
        ctx.advance(State::NeedKeyLookup);
        Ok(())
    }

    async fn lookup_keys(&self, ctx: &mut AutoEncryptionContext) -> Result<(), Error> {
        let unresolved: Vec<KeyRef> = ctx.key_refs.iter().filter(|r| !ctx.keys.contains(r)).cloned().collect();

        for key in self.key_vault.find_many(&unresolved).await? {
            if !unresolved.iter().any(|r| key.matches(r)) {
                continue;
            }
            if ctx.keys.contains(&KeyRef::Id(key.id())) || ctx.remote_keys.iter().any(|k| k.id() == key.id()) {
                continue;
            }
            match key.master_key().kind() {
                ProviderKind::Local => {
                    let resolved = self.providers.unwrap(&key).await?;
                    ctx.keys.insert(resolved, key.key_alt_names());
                }
                ProviderKind::Remote => ctx.remote_keys.push(key),
            }
        }

        if ctx.remote_keys.is_empty() {
            ctx.advance(State::Ready);
        } else {
            ctx.advance(State::NeedKms);
        }
        Ok(())
    }

    async fn unwrap_remote_keys(&self, ctx: &mut AutoEncryptionContext) -> Result<(), Error> {
        let remote = std::mem::take(&mut ctx.remote_keys);
        tracing::debug!(count = remote.len(), "unwrapping data keys with remote KMS");

        let resolved = try_join_all(remote.iter().map(|key| self.providers.unwrap(key))).await?;
        for (key, material) in remote.iter().zip(resolved) {
            ctx.keys.insert(material, key.key_alt_names());
        }

        ctx.advance(State::Ready);
        Ok(())
    }
}

fn push_unique(refs: &mut Vec<KeyRef>, key_ref: KeyRef) {
    if !refs.contains(&key_ref) {
        refs.push(key_ref);
    }
}

fn start(ctx: &mut AutoEncryptionContext) -> Result<(), Error> {
    match ctx.operation().clone() {
        Operation::AutoEncrypt => ctx.advance(State::NeedSchema),
        Operation::AutoDecrypt => {
            let mut refs = Vec::new();
            collect(&ctx.pending, TransformMode::EncryptedToPlain, &mut |leaf: &Binary| {
                push_unique(&mut refs, KeyRef::Id(EncryptedEnvelope::from_binary(leaf)?.key_id()));
                Ok(())
            })?;
            if refs.is_empty() {
                let reply = std::mem::take(&mut ctx.pending);
                ctx.finish(reply);
            } else {
                ctx.key_refs = refs;
                ctx.advance(State::NeedKeyLookup);
            }
        }
        Operation::ExplicitEncrypt { key_ref, .. } => {
            ctx.key_refs = vec![key_ref];
            ctx.advance(State::NeedKeyLookup);
        }
        Operation::ExplicitDecrypt => {
            let envelope = match ctx.pending.get("v") {
                Some(Bson::Binary(binary)) => EncryptedEnvelope::from_binary(binary)?,
                _ => {
                    return Err(Error::InvalidArgument(
                        "explicit decryption expects an encrypted binary value".to_string(),
                    ))
                }
            };
            ctx.key_refs = vec![KeyRef::Id(envelope.key_id())];
            ctx.advance(State::NeedKeyLookup);
        }
    }
    Ok(())
}

fn finalize(ctx: &mut AutoEncryptionContext) -> Result<(), Error> {
    let output = match ctx.operation() {
        Operation::AutoEncrypt => {
            transform(&ctx.pending, TransformMode::MarkingsToEncrypted, &mut EncryptVisitor::new(&ctx.keys))?
        }
        Operation::AutoDecrypt | Operation::ExplicitDecrypt => {
            transform(&ctx.pending, TransformMode::EncryptedToPlain, &mut DecryptVisitor::new(&ctx.keys))?
        }
        Operation::ExplicitEncrypt { key_ref, algorithm } => {
            let value = ctx
                .pending
                .get("v")
                .cloned()
                .ok_or_else(|| Error::InvalidArgument("explicit encryption has no value".to_string()))?;
            let key = ctx.keys.require(key_ref)?;
            let plaintext = Zeroizing::new(wrap_value(&value)?);
            let iv = generate_iv(*algorithm, key, &plaintext)?;
            let ciphertext = encrypt_field(key, &iv, &plaintext)?;
            let mut out = Document::new();
            out.insert("v", Bson::Binary(build_envelope(key.id(), iv, ciphertext)?));
            out
        }
    };
    ctx.finish(output);
    Ok(())
}

fn take_value(mut doc: Document) -> Result<Bson, Error> {
    doc.remove("v")
        .ok_or_else(|| Error::InvalidArgument("explicit operation produced no value".to_string()))
}
