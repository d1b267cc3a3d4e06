//! Content-addressed identifiers.
//!
//! Everything the cache stores is keyed by an [`Id`]: a small structural
//! value supporting equality, ordering, hashing, and a stable textual form.
//! Ids for composite work (function applications, meta requests) are built
//! by folding the parts into a SHA-256 digest with [`Sha256IdHasher`], so an
//! id depends only on the logical content it names and nothing else.
//!
//! [`CapturedId`] is the owning form used as a map key: it shares the
//! underlying id behind an `Arc`, compares and hashes through the pointee,
//! and can be looked up by a borrowed `&Id` without cloning.
//!
//! # Examples
//!
//! ```rust
//! use gantry::identity::{Id, Sha256IdHasher};
//!
//! let a = Id::from("alpha");
//! let b = Id::from(42i64);
//!
//! let mut hasher = Sha256IdHasher::new();
//! hasher.fold_str("pair");
//! hasher.fold_id(&a);
//! hasher.fold_id(&b);
//! let composed = hasher.into_id();
//!
//! assert_ne!(composed, Id::pair(a, b));
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use sha2::{Digest, Sha256};

use crate::codec;
use crate::value::Value;

/// A polymorphic content-addressed identifier.
///
/// Comparison across variants orders by the declaration order of the
/// variants first, then by the variant-internal value, which gives a total,
/// stable order over heterogenous ids.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Id {
    Bool(bool),
    Integer(i64),
    Float(OrderedFloat<f64>),
    Str(String),
    /// An ordered tuple of sub-ids.
    Tuple(Vec<Id>),
    /// A SHA-256 digest over an ordered sequence of folded components.
    Digest([u8; 32]),
}

impl Id {
    /// Pairs two ids into a tuple id.
    pub fn pair(first: Id, second: Id) -> Id {
        Id::Tuple(vec![first, second])
    }

    /// Captures this id into its owning, shareable form.
    pub fn capture(self) -> CapturedId {
        CapturedId(Arc::new(self))
    }

    /// Writes the canonical byte fold of this id. This is what
    /// [`Sha256IdHasher::fold_id`] feeds to the digest, so it must be
    /// injective over structurally distinct ids: every variant writes a tag
    /// byte, and variable-length payloads are length-prefixed.
    fn fold_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Id::Bool(b) => {
                out.push(0);
                out.push(*b as u8);
            }
            Id::Integer(i) => {
                out.push(1);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Id::Float(f) => {
                out.push(2);
                out.extend_from_slice(&f.into_inner().to_le_bytes());
            }
            Id::Str(s) => {
                out.push(3);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Id::Tuple(ids) => {
                out.push(4);
                out.extend_from_slice(&(ids.len() as u64).to_le_bytes());
                for id in ids {
                    id.fold_bytes(out);
                }
            }
            Id::Digest(digest) => {
                out.push(5);
                out.extend_from_slice(digest);
            }
        }
    }
}

impl From<bool> for Id {
    fn from(value: bool) -> Self {
        Id::Bool(value)
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Integer(value)
    }
}

impl From<f64> for Id {
    fn from(value: f64) -> Self {
        Id::Float(OrderedFloat(value))
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Str(value.to_owned())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Str(value)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Bool(b) => write!(f, "{b}"),
            Id::Integer(i) => write!(f, "{i}"),
            Id::Float(x) => write!(f, "{x}"),
            Id::Str(s) => f.write_str(s),
            Id::Tuple(ids) => {
                f.write_str("(")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{id}")?;
                }
                f.write_str(")")
            }
            Id::Digest(digest) => f.write_str(&hex::encode(digest)),
        }
    }
}

/// Streaming SHA-256 composition of an id from heterogenous parts.
///
/// Strings feed their raw bytes; dynamic values feed their canonical native
/// encoding (the same bytes used for on-wire identity); ids feed their
/// canonical fold. The finished digest is itself an [`Id`], so compositions
/// nest.
pub struct Sha256IdHasher {
    hasher: Sha256,
}

impl Sha256IdHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn fold_str(&mut self, value: &str) {
        self.hasher.update(value.as_bytes());
    }

    pub fn fold_value(&mut self, value: &Value) {
        self.hasher.update(codec::write_natively_encoded_value(value));
    }

    pub fn fold_id(&mut self, id: &Id) {
        let mut bytes = Vec::new();
        id.fold_bytes(&mut bytes);
        self.hasher.update(&bytes);
    }

    pub fn into_id(self) -> Id {
        Id::Digest(self.hasher.finalize().into())
    }
}

impl Default for Sha256IdHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// An owning container stabilizing one [`Id`].
///
/// Captured ids compare equal iff the underlying ids compare equal. The
/// `Arc` makes sharing the key between a map slot and its record free, and
/// `Borrow<Id>` lets map lookups use a plain borrowed id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapturedId(Arc<Id>);

impl CapturedId {
    pub fn id(&self) -> &Id {
        &self.0
    }
}

impl Borrow<Id> for CapturedId {
    fn borrow(&self) -> &Id {
        &self.0
    }
}

impl fmt::Display for CapturedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for CapturedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}
