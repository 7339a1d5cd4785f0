//! Binary sub-formats carried inside BSON documents.
//!
//! Two formats travel as BSON binary values:
//!
//! - **Markings** (subtype [`INTENT_TO_ENCRYPT`]) are placed by the markings
//!   service where a field must be encrypted. Payload:
//!   `{ k: UUID | alt name, iv: Binary(16), v: <value>, a?: algorithm, u?: alt name }`
//! - **Envelopes** (subtype [`ENCRYPTED`]) replace a marking once encrypted.
//!   Payload: `{ k: Binary(UUID), iv: Binary(16), e: Binary(ENCRYPTED_PAYLOAD) }`
//!
//! All functions here are pure.

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document, Uuid};

use crate::data_key::{uuid_binary, uuid_from_binary, Algorithm, KeyRef};
use crate::error::Error;

/// Binary subtype of an intent-to-encrypt marking.
pub const INTENT_TO_ENCRYPT: BinarySubtype = BinarySubtype::UserDefined(0x80);

/// Binary subtype of an encrypted envelope.
pub const ENCRYPTED: BinarySubtype = BinarySubtype::Encrypted;

/// Binary subtype of the ciphertext inside an envelope.
pub const ENCRYPTED_PAYLOAD: BinarySubtype = BinarySubtype::UserDefined(0x81);

/// Length of every IV carried by markings and envelopes.
pub const IV_LEN: usize = 16;

/// A parsed intent-to-encrypt marking.
#[derive(Debug, Clone, PartialEq)]
pub struct Marking {
    key_ref: KeyRef,
    iv: [u8; IV_LEN],
    value: Bson,
    algorithm: Option<Algorithm>,
    alt_name_hint: Option<String>,
}

impl Marking {
    /// Creates a marking for `value`.
    #[must_use]
    pub const fn new(key_ref: KeyRef, iv: [u8; IV_LEN], value: Bson) -> Self {
        Self { key_ref, iv, value, algorithm: None, alt_name_hint: None }
    }

    /// Records the algorithm the markings service selected.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// Records an alternate name hint.
    #[must_use]
    pub fn with_alt_name_hint(mut self, name: impl Into<String>) -> Self {
        self.alt_name_hint = Some(name.into());
        self
    }

    /// Returns the key reference.
    #[must_use]
    pub const fn key_ref(&self) -> &KeyRef {
        &self.key_ref
    }

    /// Returns the IV.
    #[must_use]
    pub const fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Returns the value to encrypt.
    #[must_use]
    pub const fn value(&self) -> &Bson {
        &self.value
    }

    /// Returns the `a` field, if present and recognised.
    #[must_use]
    pub const fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    /// Returns the `u` field, if present.
    #[must_use]
    pub fn alt_name_hint(&self) -> Option<&str> {
        self.alt_name_hint.as_deref()
    }

    /// Parses a marking from a BSON binary.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedMarking` if the subtype is wrong, the payload
    /// is not a document, or `k`/`v` are missing. Returns `Error::InvalidIV`
    /// if `iv` is missing or not exactly 16 bytes.
    pub fn from_binary(binary: &Binary) -> Result<Self, Error> {
        if binary.subtype != INTENT_TO_ENCRYPT {
            return Err(Error::MalformedMarking(format!(
                "expected binary subtype {:#04x}, found {:#04x}",
                u8::from(INTENT_TO_ENCRYPT),
                u8::from(binary.subtype)
            )));
        }

        let payload = Document::from_reader(binary.bytes.as_slice())
            .map_err(|e| Error::MalformedMarking(format!("payload is not a document: {e}")))?;

        let key_ref = payload
            .get("k")
            .ok_or_else(|| Error::MalformedMarking("no 'k' field".to_string()))
            .and_then(|k| {
                KeyRef::from_bson(k).ok_or_else(|| {
                    Error::MalformedMarking("'k' must be a UUID binary or a string".to_string())
                })
            })?;

        let iv = read_iv(&payload)?;

        let value =
            payload.get("v").cloned().ok_or_else(|| Error::MalformedMarking("no 'v' field".to_string()))?;

        let algorithm = match payload.get("a") {
            Some(Bson::String(name)) => name.parse::<Algorithm>().map_or_else(
                |_| {
                    tracing::debug!(algorithm = %name, "ignoring unrecognised marking algorithm");
                    None
                },
                Some,
            ),
            _ => None,
        };

        let alt_name_hint = match payload.get("u") {
            Some(Bson::String(name)) => Some(name.clone()),
            _ => None,
        };

        Ok(Self { key_ref, iv, value, algorithm, alt_name_hint })
    }

    /// Encodes the marking as a BSON binary.
    ///
    /// # Errors
    ///
    /// Returns `Error::BsonSerialization` if the payload cannot be written.
    pub fn to_binary(&self) -> Result<Binary, Error> {
        let mut payload = doc! {
            "k": self.key_ref.to_bson(),
            "iv": generic(self.iv.to_vec()),
            "v": self.value.clone(),
        };
        if let Some(algorithm) = self.algorithm {
            payload.insert("a", algorithm.as_str());
        }
        if let Some(name) = &self.alt_name_hint {
            payload.insert("u", name.as_str());
        }
        Ok(Binary { subtype: INTENT_TO_ENCRYPT, bytes: to_bytes(&payload)? })
    }
}

/// A parsed encrypted envelope.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    key_id: Uuid,
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Creates an envelope.
    ///
    /// # Arguments
    ///
    /// * `key_id` - Id of the data key that encrypted the value
    /// * `iv` - IV used for encryption
    /// * `ciphertext` - Ciphertext including the authentication tag
    #[must_use]
    pub const fn new(key_id: Uuid, iv: [u8; IV_LEN], ciphertext: Vec<u8>) -> Self {
        Self { key_id, iv, ciphertext }
    }

    /// Returns the data key id.
    #[must_use]
    pub const fn key_id(&self) -> Uuid {
        self.key_id
    }

    /// Returns the IV.
    #[must_use]
    pub const fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Returns the ciphertext.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Parses an envelope from a BSON binary.
    ///
    /// # Errors
    ///
    /// - `Error::MalformedEnvelope` for a wrong subtype, an unreadable payload
    ///   or a missing/non-UUID `k`
    /// - `Error::InvalidIV` if `iv` is missing or not 16 bytes
    /// - `Error::InvalidCiphertext` if `e` is missing or of the wrong subtype
    pub fn from_binary(binary: &Binary) -> Result<Self, Error> {
        if binary.subtype != ENCRYPTED {
            return Err(Error::MalformedEnvelope(format!(
                "expected binary subtype {:#04x}, found {:#04x}",
                u8::from(ENCRYPTED),
                u8::from(binary.subtype)
            )));
        }

        let payload = Document::from_reader(binary.bytes.as_slice())
            .map_err(|e| Error::MalformedEnvelope(format!("payload is not a document: {e}")))?;

        let key_id = match payload.get("k") {
            Some(Bson::Binary(k)) => uuid_from_binary(k),
            _ => None,
        }
        .ok_or_else(|| Error::MalformedEnvelope("'k' must be a UUID binary".to_string()))?;

        let iv = read_iv(&payload)?;

        let ciphertext = match payload.get("e") {
            Some(Bson::Binary(e)) if e.subtype == ENCRYPTED_PAYLOAD => e.bytes.clone(),
            Some(Bson::Binary(e)) => {
                return Err(Error::InvalidCiphertext(format!(
                    "'e' has binary subtype {:#04x}",
                    u8::from(e.subtype)
                )))
            }
            Some(_) => return Err(Error::InvalidCiphertext("'e' is not binary".to_string())),
            None => return Err(Error::InvalidCiphertext("no 'e' field".to_string())),
        };

        Ok(Self { key_id, iv, ciphertext })
    }

    /// Encodes the envelope as a BSON binary.
    ///
    /// Equal inputs always produce identical bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::BsonSerialization` if the payload cannot be written.
    pub fn to_binary(&self) -> Result<Binary, Error> {
        let payload = doc! {
            "k": uuid_binary(self.key_id),
            "iv": generic(self.iv.to_vec()),
            "e": Binary { subtype: ENCRYPTED_PAYLOAD, bytes: self.ciphertext.clone() },
        };
        Ok(Binary { subtype: ENCRYPTED, bytes: to_bytes(&payload)? })
    }
}

impl std::fmt::Debug for EncryptedEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedEnvelope")
            .field("key_id", &self.key_id)
            .field("iv", &hex::encode(self.iv))
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Parses an intent-to-encrypt marking.
///
/// # Errors
///
/// See [`Marking::from_binary`].
pub fn parse_marking(binary: &Binary) -> Result<Marking, Error> {
    Marking::from_binary(binary)
}

/// Parses an encrypted envelope.
///
/// # Errors
///
/// See [`EncryptedEnvelope::from_binary`].
pub fn parse_envelope(binary: &Binary) -> Result<EncryptedEnvelope, Error> {
    EncryptedEnvelope::from_binary(binary)
}

/// Builds an encrypted envelope binary.
///
/// # Errors
///
/// Returns `Error::BsonSerialization` if the payload cannot be written.
pub fn build_envelope(key_id: Uuid, iv: [u8; IV_LEN], ciphertext: Vec<u8>) -> Result<Binary, Error> {
    EncryptedEnvelope::new(key_id, iv, ciphertext).to_binary()
}

/// Builds a marking binary.
///
/// # Errors
///
/// Returns `Error::BsonSerialization` if the payload cannot be written.
pub fn build_marking(marking: &Marking) -> Result<Binary, Error> {
    marking.to_binary()
}

fn read_iv(payload: &Document) -> Result<[u8; IV_LEN], Error> {
    match payload.get("iv") {
        Some(Bson::Binary(iv)) => iv.bytes.as_slice().try_into().map_err(|_| {
            Error::InvalidIV(format!("expected {IV_LEN} bytes, found {}", iv.bytes.len()))
        }),
        Some(_) => Err(Error::InvalidIV("'iv' is not binary".to_string())),
        None => Err(Error::InvalidIV("no 'iv' field".to_string())),
    }
}

const fn generic(bytes: Vec<u8>) -> Binary {
    Binary { subtype: BinarySubtype::Generic, bytes }
}

fn to_bytes(doc: &Document) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::new();
    doc.to_writer(&mut bytes)?;
    Ok(bytes)
}
