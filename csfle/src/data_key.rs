//! Key-vault data model: data keys, master keys, key references and algorithms.

use std::fmt;
use std::str::FromStr;

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, DateTime, Document, Uuid};

use crate::error::Error;

/// Reference to a data key, either by id or by one of its alternate names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyRef {
    /// The key's `_id`.
    Id(Uuid),
    /// One of the key's `keyAltNames`.
    AltName(String),
}

impl KeyRef {
    /// Builds a reference from the two optional lookup arguments.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` unless exactly one of `id` and
    /// `alt_name` is provided.
    pub fn from_options(id: Option<Uuid>, alt_name: Option<&str>) -> Result<Self, Error> {
        match (id, alt_name) {
            (Some(id), None) => Ok(Self::Id(id)),
            (None, Some(name)) => Ok(Self::AltName(name.to_string())),
            (Some(_), Some(_)) => Err(Error::InvalidArgument(
                "provide either a key id or a key alt name, not both".to_string(),
            )),
            (None, None) => {
                Err(Error::InvalidArgument("a key id or a key alt name is required".to_string()))
            }
        }
    }

    /// Reads a key reference from a marking's `k` value.
    ///
    /// Accepts a 16-byte UUID binary of subtype 4 or a UTF-8 alternate name.
    pub(crate) fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::String(name) => Some(Self::AltName(name.clone())),
            Bson::Binary(binary) => uuid_from_binary(binary).map(Self::Id),
            _ => None,
        }
    }

    /// Encodes the reference the way markings carry it.
    #[must_use]
    pub fn to_bson(&self) -> Bson {
        match self {
            Self::Id(id) => Bson::Binary(uuid_binary(*id)),
            Self::AltName(name) => Bson::String(name.clone()),
        }
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::AltName(name) => write!(f, "alt name '{name}'"),
        }
    }
}

/// Field encryption algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Equal plaintexts under the same key produce equal ciphertexts.
    Deterministic,
    /// A fresh random IV for every encryption.
    #[default]
    Random,
}

impl Algorithm {
    /// Wire name of the algorithm.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "AEAD_AES_256_GCM_HMAC_SHA_256-Deterministic",
            Self::Random => "AEAD_AES_256_GCM_HMAC_SHA_256-Random",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::Deterministic.as_str() {
            Ok(Self::Deterministic)
        } else if s == Self::Random.as_str() {
            Ok(Self::Random)
        } else {
            Err(Error::InvalidArgument(format!("unknown algorithm: {s}")))
        }
    }
}

/// Master key parameters for the AWS KMS provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsMasterKey {
    /// AWS region of the customer master key.
    pub region: String,
    /// ARN or alias of the customer master key.
    pub key: String,
    /// Optional endpoint override (`host[:port]`).
    pub endpoint: Option<String>,
}

impl AwsMasterKey {
    /// Creates master key parameters without an endpoint override.
    #[must_use]
    pub fn new(region: impl Into<String>, key: impl Into<String>) -> Self {
        Self { region: region.into(), key: key.into(), endpoint: None }
    }

    /// Overrides the KMS endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Returns the KMS endpoint to contact for this key.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.endpoint.clone().unwrap_or_else(|| format!("kms.{}.amazonaws.com", self.region))
    }
}

/// Whether unwrapping needs a network round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Unwrapped in-process with the local master key.
    Local,
    /// Unwrapped by a remote KMS.
    Remote,
}

/// The master key that wraps a data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterKey {
    /// Process-held local master key.
    Local,
    /// AWS KMS customer master key.
    Aws(AwsMasterKey),
}

impl MasterKey {
    /// Returns the provider name stored in the key document.
    #[must_use]
    pub const fn provider(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Aws(_) => "aws",
        }
    }

    /// Returns whether this master key is local or remote.
    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::Local => ProviderKind::Local,
            Self::Aws(_) => ProviderKind::Remote,
        }
    }

    /// Encodes the master key as the `masterKey` sub-document.
    #[must_use]
    pub fn to_document(&self) -> Document {
        match self {
            Self::Local => doc! { "provider": "local" },
            Self::Aws(aws) => {
                let mut doc = doc! {
                    "provider": "aws",
                    "region": aws.region.as_str(),
                    "key": aws.key.as_str(),
                };
                if let Some(endpoint) = &aws.endpoint {
                    doc.insert("endpoint", endpoint.as_str());
                }
                doc
            }
        }
    }

    /// Decodes a `masterKey` sub-document.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyVaultQueryFailed` if the provider is unknown or a
    /// required field is missing.
    pub fn from_document(doc: &Document) -> Result<Self, Error> {
        let provider = doc
            .get_str("provider")
            .map_err(|_| malformed_key("masterKey has no 'provider'"))?;
        match provider {
            "local" => Ok(Self::Local),
            "aws" => {
                let region =
                    doc.get_str("region").map_err(|_| malformed_key("aws masterKey has no 'region'"))?;
                let key = doc.get_str("key").map_err(|_| malformed_key("aws masterKey has no 'key'"))?;
                let endpoint = doc.get_str("endpoint").ok().map(str::to_string);
                Ok(Self::Aws(AwsMasterKey {
                    region: region.to_string(),
                    key: key.to_string(),
                    endpoint,
                }))
            }
            other => Err(malformed_key(&format!("unsupported masterKey provider '{other}'"))),
        }
    }
}

/// Status value for an active key.
const STATUS_ACTIVE: i32 = 0;

/// A data key document from the key vault collection.
///
/// `key_material` is the *wrapped* key; it is only usable after a KMS
/// provider has unwrapped it into a [`crate::keyring::ResolvedKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct DataKey {
    id: Uuid,
    key_material: Vec<u8>,
    master_key: MasterKey,
    key_alt_names: Vec<String>,
    creation_date: DateTime,
    update_date: DateTime,
    status: i32,
}

impl DataKey {
    /// Creates a new active data key document.
    #[must_use]
    pub fn new(
        id: Uuid,
        key_material: Vec<u8>,
        master_key: MasterKey,
        key_alt_names: Vec<String>,
    ) -> Self {
        let now = DateTime::now();
        Self {
            id,
            key_material,
            master_key,
            key_alt_names,
            creation_date: now,
            update_date: now,
            status: STATUS_ACTIVE,
        }
    }

    /// Returns the key id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the wrapped key material.
    #[must_use]
    pub fn key_material(&self) -> &[u8] {
        &self.key_material
    }

    /// Returns the master key that wraps this data key.
    #[must_use]
    pub const fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    /// Returns the alternate names of this key.
    #[must_use]
    pub fn key_alt_names(&self) -> &[String] {
        &self.key_alt_names
    }

    /// Returns true if this key satisfies the given reference.
    #[must_use]
    pub fn matches(&self, key_ref: &KeyRef) -> bool {
        match key_ref {
            KeyRef::Id(id) => self.id == *id,
            KeyRef::AltName(name) => self.key_alt_names.iter().any(|n| n == name),
        }
    }

    /// Encodes the key as a key vault document.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "_id": uuid_binary(self.id),
            "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: self.key_material.clone() },
            "creationDate": self.creation_date,
            "updateDate": self.update_date,
            "status": self.status,
            "masterKey": self.master_key.to_document(),
        };
        if !self.key_alt_names.is_empty() {
            let names: Vec<Bson> = self.key_alt_names.iter().map(|n| Bson::String(n.clone())).collect();
            doc.insert("keyAltNames", names);
        }
        doc
    }

    /// Decodes a key vault document.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyVaultQueryFailed` if the document is not a valid
    /// data key.
    pub fn from_document(doc: &Document) -> Result<Self, Error> {
        let id = match doc.get("_id") {
            Some(Bson::Binary(binary)) => uuid_from_legacy_binary(binary),
            _ => None,
        }
        .ok_or_else(|| malformed_key("'_id' is not a UUID"))?;

        let key_material = doc
            .get_binary_generic("keyMaterial")
            .map_err(|_| malformed_key("'keyMaterial' is not binary"))?
            .clone();

        let master_key = MasterKey::from_document(
            doc.get_document("masterKey").map_err(|_| malformed_key("missing 'masterKey'"))?,
        )?;

        let key_alt_names = match doc.get("keyAltNames") {
            None | Some(Bson::Null) => Vec::new(),
            Some(Bson::Array(names)) => names
                .iter()
                .map(|n| n.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| malformed_key("'keyAltNames' must hold strings"))?,
            Some(_) => return Err(malformed_key("'keyAltNames' is not an array")),
        };

        let now = DateTime::now();
        Ok(Self {
            id,
            key_material,
            master_key,
            key_alt_names,
            creation_date: doc.get_datetime("creationDate").copied().unwrap_or(now),
            update_date: doc.get_datetime("updateDate").copied().unwrap_or(now),
            status: doc.get_i32("status").unwrap_or(STATUS_ACTIVE),
        })
    }
}

/// Encodes a UUID as a subtype 4 binary.
pub(crate) fn uuid_binary(id: Uuid) -> Binary {
    Binary { subtype: BinarySubtype::Uuid, bytes: id.bytes().to_vec() }
}

/// Reads a UUID from a 16-byte binary of subtype 4.
pub(crate) fn uuid_from_binary(binary: &Binary) -> Option<Uuid> {
    if binary.subtype != BinarySubtype::Uuid {
        return None;
    }
    uuid_from_bytes(&binary.bytes)
}

/// Like [`uuid_from_binary`] but also takes legacy subtype 3, which older
/// drivers wrote into key vault `_id` fields.
fn uuid_from_legacy_binary(binary: &Binary) -> Option<Uuid> {
    match binary.subtype {
        BinarySubtype::UuidOld => uuid_from_bytes(&binary.bytes),
        _ => uuid_from_binary(binary),
    }
}

fn uuid_from_bytes(bytes: &[u8]) -> Option<Uuid> {
    let bytes: [u8; 16] = bytes.try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

fn malformed_key(msg: &str) -> Error {
    Error::KeyVaultQueryFailed(format!("malformed data key document: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ref_from_options() {
        let id = Uuid::new();
        assert_eq!(KeyRef::from_options(Some(id), None).unwrap(), KeyRef::Id(id));
        assert_eq!(
            KeyRef::from_options(None, Some("patients")).unwrap(),
            KeyRef::AltName("patients".to_string())
        );
        assert!(matches!(KeyRef::from_options(None, None), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            KeyRef::from_options(Some(id), Some("patients")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_key_ref_bson_forms() {
        let id = Uuid::new();
        assert_eq!(KeyRef::from_bson(&KeyRef::Id(id).to_bson()), Some(KeyRef::Id(id)));
        assert_eq!(
            KeyRef::from_bson(&Bson::String("alt".to_string())),
            Some(KeyRef::AltName("alt".to_string()))
        );

        let legacy = Bson::Binary(Binary { subtype: BinarySubtype::UuidOld, bytes: id.bytes().to_vec() });
        assert_eq!(KeyRef::from_bson(&legacy), None);

        let short = Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes: vec![1, 2, 3] });
        assert_eq!(KeyRef::from_bson(&short), None);
        assert_eq!(KeyRef::from_bson(&Bson::Int32(7)), None);
    }

    #[test]
    fn test_algorithm_names() {
        for algorithm in [Algorithm::Deterministic, Algorithm::Random] {
            assert_eq!(algorithm.as_str().parse::<Algorithm>().unwrap(), algorithm);
        }
        assert!("AES-ECB".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_data_key_document_round_trip() {
        let master_key = MasterKey::Aws(
            AwsMasterKey::new("us-east-1", "arn:aws:kms:us-east-1:123:key/abc")
                .with_endpoint("localhost:8443"),
        );
        let key = DataKey::new(Uuid::new(), vec![7; 60], master_key, vec!["patients".to_string()]);

        let doc = key.to_document();
        assert_eq!(doc.get_document("masterKey").unwrap().get_str("provider").unwrap(), "aws");

        let parsed = DataKey::from_document(&doc).unwrap();
        assert_eq!(parsed.id(), key.id());
        assert_eq!(parsed.key_material(), key.key_material());
        assert_eq!(parsed.master_key(), key.master_key());
        assert_eq!(parsed.key_alt_names(), ["patients".to_string()]);
        assert!(parsed.matches(&KeyRef::AltName("patients".to_string())));
        assert!(parsed.matches(&KeyRef::Id(key.id())));
        assert!(!parsed.matches(&KeyRef::AltName("billing".to_string())));
    }

    #[test]
    fn test_data_key_accepts_legacy_id() {
        let key = DataKey::new(Uuid::new(), vec![7; 60], MasterKey::Local, vec![]);
        let mut doc = key.to_document();
        doc.insert("_id", Binary { subtype: BinarySubtype::UuidOld, bytes: key.id().bytes().to_vec() });
        assert_eq!(DataKey::from_document(&doc).unwrap().id(), key.id());

        doc.insert("_id", Binary { subtype: BinarySubtype::Generic, bytes: key.id().bytes().to_vec() });
        assert!(matches!(DataKey::from_document(&doc), Err(Error::KeyVaultQueryFailed(_))));
    }

    #[test]
    fn test_data_key_rejects_malformed_documents() {
        let doc = doc! { "_id": "not-a-uuid", "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: vec![1] } };
        assert!(matches!(DataKey::from_document(&doc), Err(Error::KeyVaultQueryFailed(_))));

        let doc = doc! {
            "_id": uuid_binary(Uuid::new()),
            "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: vec![1] },
            "masterKey": { "provider": "gcp" },
        };
        assert!(matches!(DataKey::from_document(&doc), Err(Error::KeyVaultQueryFailed(_))));
    }

    #[test]
    fn test_aws_default_endpoint() {
        let key = AwsMasterKey::new("eu-west-1", "alias/fle");
        assert_eq!(key.endpoint(), "kms.eu-west-1.amazonaws.com");
        assert_eq!(MasterKey::Aws(key).kind(), ProviderKind::Remote);
        assert_eq!(MasterKey::Local.kind(), ProviderKind::Local);
    }
}
