//! Entry codec
//!
//! A [`MangledEntry`] is the storable form of a tuple: its type, the chain of
//! supertypes, and an ordered list of named fields. A field without a value
//! is null, and in a template null is a wildcard that matches anything.
//!
//! Field values hash to 32 bits (xxh64 over the value's bincode encoding,
//! folded). The hashes drive the secondary indexes, so two equal values
//! always hash alike, while equal hashes still need a full comparison.

mod persistent;

pub use persistent::PersistentEntry;

use serde::{Deserialize, Serialize};
use tracing::warn;
use tuplespace_common::{Error, Result, TypeName};
use xxhash_rust::xxh64::xxh64;

/// A typed field value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
}

impl Value {
    /// Index hash of this value
    #[must_use]
    pub fn hash_code(&self) -> u32 {
        let encoded = bincode::serialize(self).unwrap_or_default();
        let h = xxh64(&encoded, 0);
        (h ^ (h >> 32)) as u32
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// One named field, `None` is null
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MangledField {
    pub name: String,
    pub value: Option<Value>,
}

/// Storable form of an entry or a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MangledEntry {
    type_name: TypeName,
    /// Direct supertype first
    supertypes: Vec<TypeName>,
    fields: Vec<MangledField>,
}

impl MangledEntry {
    /// Create an entry without fields
    pub fn new(type_name: impl Into<TypeName>) -> Self {
        Self {
            type_name: type_name.into(),
            supertypes: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Append a field with a value
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push(MangledField {
            name: name.into(),
            value: Some(value.into()),
        });
        self
    }

    /// Append a null field
    #[must_use]
    pub fn with_null(mut self, name: impl Into<String>) -> Self {
        self.fields.push(MangledField {
            name: name.into(),
            value: None,
        });
        self
    }

    /// Append a supertype, nearest first
    #[must_use]
    pub fn with_supertype(mut self, name: impl Into<TypeName>) -> Self {
        self.supertypes.push(name.into());
        self
    }

    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    pub fn supertypes(&self) -> &[TypeName] {
        &self.supertypes
    }

    pub fn fields(&self) -> &[MangledField] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Field names in declaration order
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Whether field `i` is null (or absent)
    #[must_use]
    pub fn is_null(&self, i: usize) -> bool {
        self.fields.get(i).is_none_or(|f| f.value.is_none())
    }

    /// A template whose fields are all null matches every entry of its type
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.fields.iter().all(|f| f.value.is_none())
    }

    /// Index hash of field `i`, `None` for null fields
    #[must_use]
    pub fn field_hash(&self, i: usize) -> Option<u32> {
        self.fields
            .get(i)
            .and_then(|f| f.value.as_ref())
            .map(Value::hash_code)
    }

    /// Hash of every field, null fields hash to zero
    pub fn hash_codes(&self) -> Vec<u32> {
        (0..self.fields.len())
            .map(|i| self.field_hash(i).unwrap_or(0))
            .collect()
    }

    /// Full positional comparison against a template.
    ///
    /// Null template fields match anything. A shorter template compares the
    /// common prefix. A longer one is logged, and any non-null field past the
    /// entry's last field fails the match.
    #[must_use]
    pub fn matches(&self, template: &Self) -> bool {
        // Subtype entries extend their supertype's fields, so only a longer
        // template is inconsistent
        if template.fields.len() > self.fields.len() {
            warn!(
                "Template for {} has {} fields, entry has {}",
                self.type_name,
                template.fields.len(),
                self.fields.len()
            );
            if template.fields[self.fields.len()..]
                .iter()
                .any(|t| t.value.is_some())
            {
                return false;
            }
        }
        template
            .fields
            .iter()
            .zip(&self.fields)
            .all(|(t, f)| t.value.as_ref().is_none_or(|v| f.value.as_ref() == Some(v)))
    }

    /// Opaque payload bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::codec(format!("encode entry: {e}")))
    }

    /// Decode an opaque payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::codec(format!("decode entry: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foo() -> MangledEntry {
        MangledEntry::new("Foo").with("a", 1i64).with("b", "x")
    }

    #[test]
    fn test_equal_values_hash_alike() {
        assert_eq!(Value::from(7i64).hash_code(), Value::Int(7).hash_code());
        assert_ne!(Value::from(7i64).hash_code(), Value::from("7").hash_code());
    }

    #[test]
    fn test_template_matching() {
        let entry = foo();
        let by_a = MangledEntry::new("Foo").with("a", 1i64).with_null("b");
        let wrong = MangledEntry::new("Foo").with_null("a").with("b", "y");

        assert!(entry.matches(&by_a));
        assert!(!entry.matches(&wrong));
        assert!(by_a.field_hash(1).is_none());
        assert!(!by_a.is_wildcard());
        assert!(
            MangledEntry::new("Foo")
                .with_null("a")
                .with_null("b")
                .is_wildcard()
        );
    }

    #[test]
    fn test_short_template_compares_prefix() {
        let entry = foo();
        let short = MangledEntry::new("Foo").with("a", 1i64);
        assert!(entry.matches(&short));
    }

    #[test]
    fn test_long_template_needs_null_tail() {
        let entry = foo();
        let null_tail = MangledEntry::new("Foo")
            .with_null("a")
            .with_null("b")
            .with_null("c");
        let valued_tail = MangledEntry::new("Foo")
            .with_null("a")
            .with_null("b")
            .with("c", 5i64);
        assert!(entry.matches(&null_tail));
        assert!(!entry.matches(&valued_tail));
    }

    #[test]
    fn test_payload_roundtrip() {
        let entry = foo().with_supertype("Base");
        let decoded = MangledEntry::from_bytes(&entry.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.supertypes(), &[TypeName::from("Base")]);
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        let err = MangledEntry::from_bytes(&[0xff; 3]).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
