//! # `csfle`
//!
//! Client-side field-level encryption for BSON documents.
//!
//! Fields named by a per-namespace JSON schema are encrypted before a command
//! leaves the process and decrypted after a reply comes back. Data keys live
//! in a key vault collection, wrapped by a local master key or a remote KMS.
//!
//! ## Features
//!
//! - AES-256-GCM field encryption bound to the data key id
//! - Random and deterministic (equality-preserving) IVs
//! - Key vault lookups with majority read concern
//! - `local` master keys and an AWS-KMS-compatible remote provider
//! - A closed state machine per operation, with bounded network round trips
//!
//! ## Example
//!
//! ```rust,ignore
//! use csfle::prelude::*;
//!
//! let options = EngineOptions::new("keyvault.datakeys")
//!     .with_local_key(base64_master_key)
//!     .with_schema("test.patients", schema);
//! let engine = EncryptionEngine::builder(options)
//!     .key_vault(runner.clone())
//!     .markings(markings)
//!     .open()?;
//!
//! let key_id = engine.create_data_key(MasterKey::Local, vec!["ssn-key".into()]).await?;
//! let command = engine.auto_encrypt("test", command).await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cipher;
pub mod config;
pub mod context;
pub mod data_key;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod key_provider;
pub mod key_vault;
pub mod keyring;
pub mod kms;
pub mod pool;
pub mod schema;
pub mod transport;
pub mod walker;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::config::EngineOptions;
    pub use crate::context::{AutoEncryptionContext, State};
    pub use crate::data_key::{Algorithm, AwsMasterKey, DataKey, KeyRef, MasterKey};
    pub use crate::engine::{EncryptionEngine, EngineBuilder};
    pub use crate::envelope::{EncryptedEnvelope, Marking};
    pub use crate::error::{Error, KmsError};
    pub use crate::key_provider::{KmsProvider, KmsProviders, LocalMasterKey};
    pub use crate::kms::{AwsCredentials, HttpKmsProvider};
    pub use crate::transport::{BoxError, CommandRunner, StreamConnector, TcpConnector};
}
