//! Unwrapped data keys scoped to a single operation.

use std::collections::HashMap;
use std::fmt;

use bson::Uuid;
use secrecy::{ExposeSecret, Secret, SecretVec};
use zeroize::Zeroizing;

use crate::data_key::KeyRef;
use crate::error::Error;
use crate::kdf::DATA_KEY_SIZE;

/// An unwrapped data key.
///
/// Material is zeroized when the value is dropped and never appears in
/// `Debug` output.
pub struct ResolvedKey {
    id: Uuid,
    material: Secret<[u8; DATA_KEY_SIZE]>,
}

impl ResolvedKey {
    /// Creates a resolved key from raw material.
    #[must_use]
    pub fn new(id: Uuid, material: [u8; DATA_KEY_SIZE]) -> Self {
        Self { id, material: Secret::new(material) }
    }

    /// Creates a resolved key from unwrapped KMS output.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnwrapFailed` if the material is not 32 bytes.
    pub fn from_secret(id: Uuid, material: &SecretVec<u8>) -> Result<Self, Error> {
        let exposed = material.expose_secret();
        if exposed.len() != DATA_KEY_SIZE {
            return Err(Error::UnwrapFailed(format!(
                "unwrapped key is {} bytes, expected {DATA_KEY_SIZE}",
                exposed.len()
            )));
        }
        let mut bytes = Zeroizing::new([0u8; DATA_KEY_SIZE]);
        bytes.copy_from_slice(exposed);
        Ok(Self { id, material: Secret::new(*bytes) })
    }

    /// Returns the key id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the raw key material.
    #[must_use]
    pub fn material(&self) -> &[u8; DATA_KEY_SIZE] {
        self.material.expose_secret()
    }
}

impl fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedKey").field("id", &self.id).field("material", &"[REDACTED]").finish()
    }
}

/// Keys resolved during one operation, indexed by id and by alt name.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: HashMap<Uuid, ResolvedKey>,
    alt_names: HashMap<String, Uuid>,
}

impl KeyRing {
    /// Creates an empty key ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key along with the alt names it answers to.
    pub fn insert(&mut self, key: ResolvedKey, alt_names: &[String]) {
        let id = key.id();
        for name in alt_names {
            self.alt_names.insert(name.clone(), id);
        }
        self.keys.insert(id, key);
    }

    /// Looks a key up by reference.
    #[must_use]
    pub fn get(&self, key_ref: &KeyRef) -> Option<&ResolvedKey> {
        match key_ref {
            KeyRef::Id(id) => self.keys.get(id),
            KeyRef::AltName(name) => self.alt_names.get(name).and_then(|id| self.keys.get(id)),
        }
    }

    /// Returns true if the reference is already resolved.
    #[must_use]
    pub fn contains(&self, key_ref: &KeyRef) -> bool {
        self.get(key_ref).is_some()
    }

    /// Looks a key up, failing with `Error::KeyNotFound`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if the reference was never resolved.
    pub fn require(&self, key_ref: &KeyRef) -> Result<&ResolvedKey, Error> {
        self.get(key_ref).ok_or_else(|| Error::KeyNotFound(key_ref.to_string()))
    }

    /// Returns the number of resolved keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no key is resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drops every resolved key.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.alt_names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_id_and_alt_name() {
        let id = Uuid::new();
        let mut ring = KeyRing::new();
        ring.insert(ResolvedKey::new(id, [5; 32]), &["patients".to_string()]);

        assert_eq!(ring.len(), 1);
        assert_eq!(ring.get(&KeyRef::Id(id)).unwrap().material(), &[5; 32]);
        assert_eq!(ring.get(&KeyRef::AltName("patients".to_string())).unwrap().id(), id);
        assert!(!ring.contains(&KeyRef::AltName("billing".to_string())));
        assert!(matches!(
            ring.require(&KeyRef::Id(Uuid::new())),
            Err(Error::KeyNotFound(_))
        ));

        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_from_secret_checks_length() {
        let id = Uuid::new();
        let key = ResolvedKey::from_secret(id, &SecretVec::new((0..32).collect())).unwrap();
        assert_eq!(key.id(), id);
        assert_eq!(key.material()[31], 31);
        for len in [0, 31, 33] {
            assert!(matches!(
                ResolvedKey::from_secret(id, &SecretVec::new(vec![1; len])),
                Err(Error::UnwrapFailed(_))
            ));
        }
    }

    #[test]
    fn test_debug_redacts_material() {
        let key = ResolvedKey::new(Uuid::new(), [0xAB; 32]);
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171, 171"));
    }
}
