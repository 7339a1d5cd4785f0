//! Structural document transform.
//!
//! One recursion over documents and arrays, parameterised by a
//! [`LeafVisitor`] that replaces the binary leaves selected by the
//! [`TransformMode`]. Keys, order and every other value are copied as-is.

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};

use crate::cipher::{decrypt_field, encrypt_field, unwrap_value, wrap_value};
use crate::data_key::KeyRef;
use crate::envelope::{EncryptedEnvelope, Marking, ENCRYPTED, INTENT_TO_ENCRYPT};
use crate::error::Error;
use crate::keyring::KeyRing;

/// Which binary leaves a transform replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    /// Replace intent-to-encrypt markings with envelopes.
    MarkingsToEncrypted,
    /// Replace envelopes with their plaintext values.
    EncryptedToPlain,
}

impl TransformMode {
    /// Binary subtype selected by this mode.
    #[must_use]
    pub const fn subtype(self) -> BinarySubtype {
        match self {
            Self::MarkingsToEncrypted => INTENT_TO_ENCRYPT,
            Self::EncryptedToPlain => ENCRYPTED,
        }
    }
}

/// Replaces one selected leaf.
pub trait LeafVisitor {
    /// Returns the value that takes the leaf's place.
    ///
    /// # Errors
    ///
    /// Any error aborts the whole transform.
    fn visit(&mut self, leaf: &Binary) -> Result<Bson, Error>;
}

/// Returns a copy of `doc` with every selected leaf replaced.
///
/// # Errors
///
/// Returns the first visitor error; no partial document is produced.
pub fn transform<V>(doc: &Document, mode: TransformMode, visitor: &mut V) -> Result<Document, Error>
where
    V: LeafVisitor + ?Sized,
{
    let mut out = Document::new();
    for (key, value) in doc {
        out.insert(key.clone(), transform_value(value, mode, visitor)?);
    }
    Ok(out)
}

fn transform_value<V>(value: &Bson, mode: TransformMode, visitor: &mut V) -> Result<Bson, Error>
where
    V: LeafVisitor + ?Sized,
{
    match value {
        Bson::Binary(binary) if binary.subtype == mode.subtype() => visitor.visit(binary),
        Bson::Document(doc) => transform(doc, mode, visitor).map(Bson::Document),
        Bson::Array(items) => items
            .iter()
            .map(|item| transform_value(item, mode, visitor))
            .collect::<Result<Vec<_>, _>>()
            .map(Bson::Array),
        other => Ok(other.clone()),
    }
}

/// Calls `f` on every selected leaf, in document order, without copying.
///
/// # Errors
///
/// Returns the first error from `f`.
pub fn collect<F>(doc: &Document, mode: TransformMode, f: &mut F) -> Result<(), Error>
where
    F: FnMut(&Binary) -> Result<(), Error>,
{
    doc.values().try_for_each(|value| collect_value(value, mode, f))
}

fn collect_value<F>(value: &Bson, mode: TransformMode, f: &mut F) -> Result<(), Error>
where
    F: FnMut(&Binary) -> Result<(), Error>,
{
    match value {
        Bson::Binary(binary) if binary.subtype == mode.subtype() => f(binary),
        Bson::Document(doc) => collect(doc, mode, f),
        Bson::Array(items) => items.iter().try_for_each(|item| collect_value(item, mode, f)),
        _ => Ok(()),
    }
}

/// Returns true if any leaf is selected by `mode`.
#[must_use]
pub fn contains_any(doc: &Document, mode: TransformMode) -> bool {
    doc.values().any(|value| value_contains(value, mode))
}

fn value_contains(value: &Bson, mode: TransformMode) -> bool {
    match value {
        Bson::Binary(binary) => binary.subtype == mode.subtype(),
        Bson::Document(doc) => contains_any(doc, mode),
        Bson::Array(items) => items.iter().any(|item| value_contains(item, mode)),
        _ => false,
    }
}

/// Turns markings into envelopes using keys from the ring.
pub struct EncryptVisitor<'a> {
    keys: &'a KeyRing,
}

impl<'a> EncryptVisitor<'a> {
    /// Creates an encrypt visitor.
    #[must_use]
    pub const fn new(keys: &'a KeyRing) -> Self {
        Self { keys }
    }
}

impl LeafVisitor for EncryptVisitor<'_> {
    fn visit(&mut self, leaf: &Binary) -> Result<Bson, Error> {
        let marking = Marking::from_binary(leaf)?;
        let key = self.keys.require(marking.key_ref())?;
        let plaintext = zeroize::Zeroizing::new(wrap_value(marking.value())?);
        let ciphertext = encrypt_field(key, marking.iv(), &plaintext)?;
        let envelope = EncryptedEnvelope::new(key.id(), *marking.iv(), ciphertext);
        Ok(Bson::Binary(envelope.to_binary()?))
    }
}

/// Turns envelopes back into plaintext values.
pub struct DecryptVisitor<'a> {
    keys: &'a KeyRing,
}

impl<'a> DecryptVisitor<'a> {
    /// Creates a decrypt visitor.
    #[must_use]
    pub const fn new(keys: &'a KeyRing) -> Self {
        Self { keys }
    }
}

impl LeafVisitor for DecryptVisitor<'_> {
    fn visit(&mut self, leaf: &Binary) -> Result<Bson, Error> {
        let envelope = EncryptedEnvelope::from_binary(leaf)?;
        let key = self.keys.require(&KeyRef::Id(envelope.key_id()))?;
        let plaintext = zeroize::Zeroizing::new(decrypt_field(key, envelope.iv(), envelope.ciphertext())?);
        unwrap_value(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::ResolvedKey;
    use bson::{doc, Uuid};

    struct Counting(usize);

    impl LeafVisitor for Counting {
        fn visit(&mut self, _leaf: &Binary) -> Result<Bson, Error> {
            self.0 += 1;
            Ok(Bson::Int32(i32::try_from(self.0).unwrap()))
        }
    }

    struct Failing;

    impl LeafVisitor for Failing {
        fn visit(&mut self, _leaf: &Binary) -> Result<Bson, Error> {
            Err(Error::KeyNotFound("test".to_string()))
        }
    }

    fn marker() -> Bson {
        Bson::Binary(Binary { subtype: INTENT_TO_ENCRYPT, bytes: vec![0] })
    }

    fn other_binary() -> Bson {
        Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: vec![1, 2] })
    }

    #[test]
    fn test_replaces_nested_leaves_in_order() {
        let input = doc! {
            "z": 1,
            "a": marker(),
            "nested": { "b": marker(), "keep": other_binary() },
            "list": [marker(), "x", [marker()]],
        };

        let out = transform(&input, TransformMode::MarkingsToEncrypted, &mut Counting(0)).unwrap();
        assert_eq!(
            out,
            doc! {
                "z": 1,
                "a": 1,
                "nested": { "b": 2, "keep": other_binary() },
                "list": [3, "x", [4]],
            }
        );
    }

    #[test]
    fn test_mode_selects_subtype() {
        let input = doc! { "a": marker() };
        let out = transform(&input, TransformMode::EncryptedToPlain, &mut Failing).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_failure_aborts() {
        let input = doc! { "ok": "fine", "bad": [marker()] };
        assert!(matches!(
            transform(&input, TransformMode::MarkingsToEncrypted, &mut Failing),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_collect_and_contains() {
        let input = doc! { "a": marker(), "b": { "c": [marker(), other_binary()] } };
        let mut seen = 0;
        collect(&input, TransformMode::MarkingsToEncrypted, &mut |_: &Binary| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 2);
        assert!(contains_any(&input, TransformMode::MarkingsToEncrypted));
        assert!(!contains_any(&input, TransformMode::EncryptedToPlain));
    }

    #[test]
    fn test_structural_fidelity_without_leaves() {
        let input = doc! {
            "f64": 1.5,
            "i64": 9_i64,
            "null": Bson::Null,
            "date": bson::DateTime::from_millis(1_700_000_000_000),
            "nested": { "arr": [1, { "x": "y" }], "bin": other_binary() },
        };
        let out = transform(&input, TransformMode::MarkingsToEncrypted, &mut Failing).unwrap();

        let mut a = Vec::new();
        let mut b = Vec::new();
        input.to_writer(&mut a).unwrap();
        out.to_writer(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encrypt_then_decrypt_visitors() {
        let id = Uuid::new();
        let mut keys = KeyRing::new();
        keys.insert(ResolvedKey::new(id, [8; 32]), &["alt".to_string()]);

        let marking = Marking::new(KeyRef::AltName("alt".to_string()), [6; 16], Bson::String("secret".to_string()));
        let input = doc! { "name": "Jon", "ssn": Bson::Binary(marking.to_binary().unwrap()) };

        let encrypted = transform(&input, TransformMode::MarkingsToEncrypted, &mut EncryptVisitor::new(&keys)).unwrap();
        let envelope = match encrypted.get("ssn") {
            Some(Bson::Binary(b)) => EncryptedEnvelope::from_binary(b).unwrap(),
            other => panic!("expected envelope, got {other:?}"),
        };
        assert_eq!(envelope.key_id(), id);

        let decrypted = transform(&encrypted, TransformMode::EncryptedToPlain, &mut DecryptVisitor::new(&keys)).unwrap();
        assert_eq!(decrypted, doc! { "name": "Jon", "ssn": "secret" });
    }
}
