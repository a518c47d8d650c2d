//! Vantage Core - Value Types
//!
//! Pure data structures shared by every other crate in the workspace: the
//! addresses of cached query results, the identity of server entities, and
//! the entity reference that backs a master/detail selection.
//! This crate contains no I/O and no cache logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod error;

pub use error::{
    FetchError, FetchErrorKind, MutationError, MutationErrorKind, SelectionParseError,
    VantageError, VantageResult,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

// ============================================================================
// CACHE KEYS
// ============================================================================

/// One primitive component of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bool(value) => write!(f, "{}", value),
            KeyPart::Int(value) => write!(f, "{}", value),
            KeyPart::Str(value) => write!(f, "\"{}\"", value.escape_default()),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        KeyPart::Int(i64::from(value))
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        KeyPart::Int(i64::from(value))
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        KeyPart::Bool(value)
    }
}

impl From<&EntityId> for KeyPart {
    fn from(value: &EntityId) -> Self {
        match value {
            EntityId::Number(n) => KeyPart::Int(*n),
            EntityId::Text(s) => KeyPart::Str(s.clone()),
        }
    }
}

impl From<EntityId> for KeyPart {
    fn from(value: EntityId) -> Self {
        KeyPart::from(&value)
    }
}

/// Address of one query result, e.g. `["projectReviews", 7]`.
///
/// Two keys are equal iff their tuples are equal component by component.
/// Serializes as a plain JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<KeyPart>);

impl CacheKey {
    /// Start a key from its root component (usually the query name).
    pub fn new(root: impl Into<KeyPart>) -> Self {
        Self(vec![root.into()])
    }

    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Append a component.
    pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn root(&self) -> Option<&KeyPart> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `prefix` is a leading sub-tuple of this key.
    ///
    /// The empty key is a prefix of every key.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", part)?;
        }
        f.write_str("]")
    }
}

/// Build a [`CacheKey`] from heterogeneous primitives.
///
/// ```
/// use vantage_core::cache_key;
/// let key = cache_key!["projectReviews", 7];
/// assert_eq!(key.to_string(), "[\"projectReviews\",7]");
/// ```
#[macro_export]
macro_rules! cache_key {
    ($($part:expr),* $(,)?) => {
        $crate::CacheKey::from_parts(vec![$($crate::KeyPart::from($part)),*])
    };
}

// ============================================================================
// ENTITY IDENTITY
// ============================================================================

/// Server-assigned identifier of an entity.
///
/// Raw text that is exactly the canonical rendering of an `i64` becomes
/// `Number`; everything else stays `Text`. Constructing through
/// [`EntityId::parse`] or the `From` impls keeps formatting and parsing
/// inverse to each other. Deserializing goes through the same path, so a
/// JSON `"42"` reads back as `Number(42)` and an empty string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged, try_from = "RawEntityId")]
pub enum EntityId {
    Number(i64),
    Text(String),
}

/// Wire shape of an id before canonicalization.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntityId {
    Number(i64),
    Text(String),
}

impl TryFrom<RawEntityId> for EntityId {
    type Error = SelectionParseError;

    fn try_from(raw: RawEntityId) -> Result<Self, Self::Error> {
        match raw {
            RawEntityId::Number(n) => Ok(EntityId::Number(n)),
            RawEntityId::Text(text) => {
                EntityId::parse(&text).ok_or(SelectionParseError::Malformed(text))
            }
        }
    }
}

impl EntityId {
    /// Parse a raw id. Returns `None` for the empty string.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        Some(Self::canonical(raw))
    }

    fn canonical(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) if n.to_string() == raw => EntityId::Number(n),
            _ => EntityId::Text(raw.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            EntityId::Number(n) => Some(*n),
            EntityId::Text(_) => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Number(n) => write!(f, "{}", n),
            EntityId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Number(value)
    }
}

impl From<i32> for EntityId {
    fn from(value: i32) -> Self {
        EntityId::Number(i64::from(value))
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::canonical(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self::canonical(&value)
    }
}

/// Reference to one entity of a given kind, e.g. `service:42`.
///
/// This is the non-null half of a selection; `Option<EntityRef>` is the
/// whole selection value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: String,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Parse `kind:id`, splitting on the first `:`.
    pub fn parse(raw: &str) -> Result<Self, SelectionParseError> {
        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| SelectionParseError::Malformed(raw.to_string()))?;
        if !is_valid_kind(kind) {
            return Err(SelectionParseError::Malformed(raw.to_string()));
        }
        let id = EntityId::parse(id).ok_or_else(|| SelectionParseError::Malformed(raw.to_string()))?;
        Ok(Self {
            kind: kind.to_string(),
            id,
        })
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Kinds are non-empty and never contain the `:` separator.
pub fn is_valid_kind(kind: &str) -> bool {
    !kind.is_empty() && !kind.contains(':')
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = SelectionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// MUTATION IDENTITY
// ============================================================================

/// Issue-ordered identifier of an optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m#{}", self.0)
    }
}
