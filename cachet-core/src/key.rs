//! Item keys and the key normalizer.
//!
//! Keys identify one cache entry. A primary key is a type tag plus an
//! identifier; a composite key adds an ordered chain of location keys that
//! scope the item (e.g. a comment under a post under a blog).
//!
//! Equality between keys arriving on events and keys a consumer is
//! interested in goes through [`normalize_key`], which erases the difference
//! between a numeric identifier and its string spelling.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// IDENTIFIER VALUES
// ============================================================================

/// Identifier carried by a primary or location key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Uuid(Uuid),
    Str(String),
}

impl KeyValue {
    /// Canonical text form, shared by all variants.
    ///
    /// `Int(5)` and `Str("5")` both render as `5`.
    pub fn canonical(&self) -> Cow<'_, str> {
        match self {
            KeyValue::Int(i) => Cow::Owned(i.to_string()),
            KeyValue::Uuid(u) => Cow::Owned(u.hyphenated().to_string()),
            KeyValue::Str(s) => Cow::Borrowed(s.as_str()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Int(i64::from(value))
    }
}

impl From<u32> for KeyValue {
    fn from(value: u32) -> Self {
        KeyValue::Int(i64::from(value))
    }
}

impl From<Uuid> for KeyValue {
    fn from(value: Uuid) -> Self {
        KeyValue::Uuid(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Str(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Str(value)
    }
}

// ============================================================================
// KEY TYPES
// ============================================================================

/// Primary key: type tag plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriKey {
    pub kt: String,
    pub pk: KeyValue,
}

/// One link of a location chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocKey {
    pub kt: String,
    pub lk: KeyValue,
}

impl LocKey {
    pub fn new(kt: impl Into<String>, lk: impl Into<KeyValue>) -> Self {
        Self {
            kt: kt.into(),
            lk: lk.into(),
        }
    }
}

/// Composite key: primary identifier scoped by a location chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComKey {
    pub kt: String,
    pub pk: KeyValue,
    pub loc: Vec<LocKey>,
}

/// Ordered chain of location keys, outermost first.
pub type LocationChain = Vec<LocKey>;

/// Key of a single cache entry.
///
/// Structural equality (`==`) compares the raw identifiers; use
/// [`ItemKey::same_as`] or [`normalize_key`] when comparing keys that may
/// have crossed a serialization boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemKey {
    Composite(ComKey),
    Primary(PriKey),
}

impl ItemKey {
    /// Build a primary key.
    pub fn primary(kt: impl Into<String>, pk: impl Into<KeyValue>) -> Self {
        ItemKey::Primary(PriKey {
            kt: kt.into(),
            pk: pk.into(),
        })
    }

    /// Build a composite key.
    pub fn composite(
        kt: impl Into<String>,
        pk: impl Into<KeyValue>,
        loc: LocationChain,
    ) -> Self {
        ItemKey::Composite(ComKey {
            kt: kt.into(),
            pk: pk.into(),
            loc,
        })
    }

    pub fn kt(&self) -> &str {
        match self {
            ItemKey::Primary(k) => &k.kt,
            ItemKey::Composite(k) => &k.kt,
        }
    }

    pub fn pk(&self) -> &KeyValue {
        match self {
            ItemKey::Primary(k) => &k.pk,
            ItemKey::Composite(k) => &k.pk,
        }
    }

    /// Location chain of a composite key; empty for primary keys.
    pub fn locations(&self) -> &[LocKey] {
        match self {
            ItemKey::Primary(_) => &[],
            ItemKey::Composite(k) => &k.loc,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, ItemKey::Composite(_))
    }

    /// Normalized string form. See [`normalize_key`].
    pub fn normalized(&self) -> String {
        normalize_key(self)
    }

    /// Equality after normalization.
    pub fn same_as(&self, other: &ItemKey) -> bool {
        self.normalized() == other.normalized()
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

// ============================================================================
// NORMALIZER
// ============================================================================

/// Canonicalize a key into a stable string for equality testing.
///
/// Identifiers are rendered through [`KeyValue::canonical`], so keys that
/// differ only in numeric-vs-string spelling normalize identically. Any
/// structural difference (type tag, identifier, location chain, or
/// primary-vs-composite shape) yields a different string.
///
/// The output is only meant for comparison; it is not a storage index.
pub fn normalize_key(key: &ItemKey) -> String {
    let mut out = String::with_capacity(48);
    out.push_str("{\"kt\":");
    push_quoted(&mut out, key.kt());
    out.push_str(",\"pk\":");
    push_quoted(&mut out, &key.pk().canonical());
    if let ItemKey::Composite(com) = key {
        out.push_str(",\"loc\":");
        push_locations(&mut out, &com.loc);
    }
    out.push('}');
    out
}

/// Canonicalize a location chain with the same rules as [`normalize_key`].
pub fn normalize_locations(locations: &[LocKey]) -> String {
    let mut out = String::with_capacity(16 + locations.len() * 24);
    push_locations(&mut out, locations);
    out
}

/// True if `prefix` matches the first links of `chain` after normalization.
///
/// An empty prefix matches every chain.
pub fn is_location_prefix(prefix: &[LocKey], chain: &[LocKey]) -> bool {
    prefix.len() <= chain.len()
        && prefix
            .iter()
            .zip(chain)
            .all(|(a, b)| a.kt == b.kt && a.lk.canonical() == b.lk.canonical())
}

fn push_locations(out: &mut String, locations: &[LocKey]) {
    out.push('[');
    for (i, loc) in locations.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str("{\"kt\":");
        push_quoted(out, &loc.kt);
        out.push_str(",\"lk\":");
        push_quoted(out, &loc.lk.canonical());
        out.push('}');
    }
    out.push(']');
}

/// Append `s` as a JSON string literal.
pub(crate) fn push_quoted(out: &mut String, s: &str) {
    out.push_str(&serde_json::Value::String(s.to_string()).to_string());
}
