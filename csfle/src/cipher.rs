//! Field cipher: AES-256-GCM with a 16-byte IV.
//!
//! Every field value is serialized as the document `{ v: <value> }` and that
//! document is encrypted. The data key id is bound as associated data, so an
//! envelope cannot be re-labelled with another key id.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use bson::{doc, Bson, Document};

use crate::data_key::Algorithm;
use crate::envelope::IV_LEN;
use crate::error::Error;
use crate::kdf::{derive_field_keys, random_iv, synthetic_iv};
use crate::keyring::ResolvedKey;

/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// AES-256-GCM with a 128-bit nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Encrypts serialized plaintext under `key` and `iv`.
///
/// The output is `plaintext.len() + TAG_SIZE` bytes and is a pure function
/// of `(key, iv, plaintext)`.
///
/// # Errors
///
/// Returns `Error::CipherInitFailed` if the cipher cannot be keyed and
/// `Error::CipherFinalizeFailed` if encryption fails.
pub fn encrypt_field(key: &ResolvedKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let sub_keys = derive_field_keys(key.material())?;
    let cipher = Aes256Gcm16::new_from_slice(sub_keys.enc_key())
        .map_err(|e| Error::CipherInitFailed(format!("invalid key length: {e}")))?;

    let mut buffer = Vec::with_capacity(plaintext.len() + 2 * BLOCK_SIZE - 1);
    buffer.extend_from_slice(plaintext);
    cipher
        .encrypt_in_place(Nonce::<U16>::from_slice(iv), &key.id().bytes(), &mut buffer)
        .map_err(|e| Error::CipherFinalizeFailed(format!("AES-256-GCM encryption failed: {e}")))?;

    buffer.shrink_to_fit();
    Ok(buffer)
}

/// Decrypts and authenticates a field ciphertext.
///
/// # Errors
///
/// Returns `Error::AuthenticationFailed` if the tag does not verify (wrong
/// key, wrong IV, or tampered ciphertext), and `Error::CipherInitFailed` if
/// the cipher cannot be keyed.
pub fn decrypt_field(key: &ResolvedKey, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::AuthenticationFailed);
    }

    let sub_keys = derive_field_keys(key.material())?;
    let cipher = Aes256Gcm16::new_from_slice(sub_keys.enc_key())
        .map_err(|e| Error::CipherInitFailed(format!("invalid key length: {e}")))?;

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place(Nonce::<U16>::from_slice(iv), &key.id().bytes(), &mut buffer)
        .map_err(|_| Error::AuthenticationFailed)?;

    Ok(buffer)
}

/// Picks the IV for a value according to the algorithm.
///
/// # Errors
///
/// Returns `Error::CipherInitFailed` if the deterministic IV key cannot be
/// derived.
pub fn generate_iv(algorithm: Algorithm, key: &ResolvedKey, plaintext: &[u8]) -> Result<[u8; IV_LEN], Error> {
    match algorithm {
        Algorithm::Random => Ok(random_iv()),
        Algorithm::Deterministic => {
            let sub_keys = derive_field_keys(key.material())?;
            synthetic_iv(sub_keys.iv_key(), &key.id().bytes(), plaintext)
        }
    }
}

/// Serializes a value as the `{ v: value }` plaintext document.
///
/// # Errors
///
/// Returns `Error::BsonSerialization` if the value cannot be written.
pub fn wrap_value(value: &Bson) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::new();
    doc! { "v": value.clone() }.to_writer(&mut bytes)?;
    Ok(bytes)
}

/// Reads the value back out of a decrypted `{ v: value }` document.
///
/// # Errors
///
/// Returns `Error::MalformedEnvelope` if the plaintext is not a document
/// with a `v` field.
pub fn unwrap_value(plaintext: &[u8]) -> Result<Bson, Error> {
    let mut doc = Document::from_reader(plaintext)
        .map_err(|e| Error::MalformedEnvelope(format!("decrypted payload is not a document: {e}")))?;
    doc.remove("v")
        .ok_or_else(|| Error::MalformedEnvelope("decrypted payload has no 'v' field".to_string()))
}
