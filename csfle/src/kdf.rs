//! Sub-key derivation and data key generation.
//!
//! A 32-byte data key is never used directly. HKDF-SHA256 expands it into
//! an encryption key for the field cipher and a separate MAC key used to
//! derive deterministic IVs.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use secrecy::SecretVec;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::envelope::IV_LEN;
use crate::error::Error;

/// Size of a data key in bytes (256 bits).
pub const DATA_KEY_SIZE: usize = 32;

const ENC_INFO: &[u8] = b"csfle/field/aes-256-gcm";
const IV_INFO: &[u8] = b"csfle/field/deterministic-iv";

type HmacSha256 = Hmac<Sha256>;

/// Sub-keys derived from one data key.
pub struct FieldKeys {
    enc_key: Zeroizing<[u8; DATA_KEY_SIZE]>,
    iv_key: Zeroizing<[u8; DATA_KEY_SIZE]>,
}

impl FieldKeys {
    /// Returns the field cipher key.
    #[must_use]
    pub fn enc_key(&self) -> &[u8; DATA_KEY_SIZE] {
        &self.enc_key
    }

    /// Returns the deterministic IV key.
    #[must_use]
    pub fn iv_key(&self) -> &[u8; DATA_KEY_SIZE] {
        &self.iv_key
    }
}

/// Derives the field sub-keys from a data key.
///
/// # Errors
///
/// Returns `Error::CipherInitFailed` if the HKDF expansion fails.
pub fn derive_field_keys(material: &[u8; DATA_KEY_SIZE]) -> Result<FieldKeys, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, material);

    let mut enc_key = Zeroizing::new([0u8; DATA_KEY_SIZE]);
    hkdf.expand(ENC_INFO, &mut *enc_key)
        .map_err(|_| Error::CipherInitFailed("HKDF expansion of the encryption key failed".to_string()))?;

    let mut iv_key = Zeroizing::new([0u8; DATA_KEY_SIZE]);
    hkdf.expand(IV_INFO, &mut *iv_key)
        .map_err(|_| Error::CipherInitFailed("HKDF expansion of the IV key failed".to_string()))?;

    Ok(FieldKeys { enc_key, iv_key })
}

/// Derives a synthetic IV: `HMAC-SHA256(iv_key, key_id || plaintext)[..16]`.
///
/// # Errors
///
/// Returns `Error::CipherInitFailed` if the MAC cannot be keyed.
pub fn synthetic_iv(
    iv_key: &[u8; DATA_KEY_SIZE],
    key_id: &[u8],
    plaintext: &[u8],
) -> Result<[u8; IV_LEN], Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(iv_key)
        .map_err(|e| Error::CipherInitFailed(format!("HMAC init failed: {e}")))?;
    mac.update(key_id);
    mac.update(plaintext);
    let tag = mac.finalize().into_bytes();

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&tag[..IV_LEN]);
    Ok(iv)
}

/// Generates a random data key.
///
/// The key must be wrapped by a master key before it is stored.
///
/// # Example
///
/// ```
/// use csfle::kdf::{generate_data_key, DATA_KEY_SIZE};
/// use secrecy::ExposeSecret;
///
/// let key = generate_data_key();
/// assert_eq!(key.expose_secret().len(), DATA_KEY_SIZE);
/// ```
#[must_use]
pub fn generate_data_key() -> SecretVec<u8> {
    use aes_gcm::aead::{rand_core::RngCore, OsRng};

    let mut key = vec![0u8; DATA_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SecretVec::new(key)
}

/// Fills a fresh random IV.
#[must_use]
pub fn random_iv() -> [u8; IV_LEN] {
    use aes_gcm::aead::{rand_core::RngCore, OsRng};

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_field_keys_are_deterministic() {
        let a = derive_field_keys(&[1u8; 32]).unwrap();
        let b = derive_field_keys(&[1u8; 32]).unwrap();
        assert_eq!(a.enc_key(), b.enc_key());
        assert_eq!(a.iv_key(), b.iv_key());
    }

    #[test]
    fn test_field_keys_are_separated() {
        let keys = derive_field_keys(&[1u8; 32]).unwrap();
        assert_ne!(keys.enc_key(), keys.iv_key());
        assert_ne!(keys.enc_key(), &[1u8; 32]);

        let other = derive_field_keys(&[2u8; 32]).unwrap();
        assert_ne!(keys.enc_key(), other.enc_key());
    }

    #[test]
    fn test_synthetic_iv() {
        let keys = derive_field_keys(&[7u8; 32]).unwrap();
        let a = synthetic_iv(keys.iv_key(), b"key-one", b"457-55-5462").unwrap();
        let b = synthetic_iv(keys.iv_key(), b"key-one", b"457-55-5462").unwrap();
        let c = synthetic_iv(keys.iv_key(), b"key-one", b"457-55-5463").unwrap();
        let d = synthetic_iv(keys.iv_key(), b"key-two", b"457-55-5462").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_synthetic_iv_is_truncated_hmac() {
        let mut key = [0u8; 32];
        key[..4].copy_from_slice(b"Jefe");
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&key).unwrap();
        mac.update(b"what do ya want for nothing?");
        let full = mac.finalize().into_bytes();

        let iv = synthetic_iv(&key, b"what do ya want ", b"for nothing?").unwrap();
        assert_eq!(&iv[..], &full[..16]);
    }

    #[test]
    fn test_generate_data_key() {
        let a = generate_data_key();
        let b = generate_data_key();
        assert_eq!(a.expose_secret().len(), DATA_KEY_SIZE);
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn test_random_iv() {
        assert_ne!(random_iv(), random_iv());
    }
}
