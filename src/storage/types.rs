//! core value types shared by the object and reference backends, and their
//! binary encoding in table columns.

use std::fmt;

use git2::{ObjectType, Oid};

use crate::storage::error::{StorageError, StoreResult};

/// raw length of an object id
pub const OID_RAWSZ: usize = 20;

/// length of an object id in hex digits
pub const OID_HEXSZ: usize = OID_RAWSZ * 2;

/// Encode an object type as stored in the `type` column.
///
/// Uses git's own numbering so rows stay readable by other tools.
pub fn object_type_to_raw(kind: ObjectType) -> StoreResult<u8> {
    match kind {
        ObjectType::Commit => Ok(1),
        ObjectType::Tree => Ok(2),
        ObjectType::Blob => Ok(3),
        ObjectType::Tag => Ok(4),
        ObjectType::Any => Err(StorageError::InvalidSpec(
            "objects must have a concrete type".to_string(),
        )),
    }
}

/// Decode the `type` column.
pub fn object_type_from_raw(raw: i64) -> StoreResult<ObjectType> {
    match raw {
        1 => Ok(ObjectType::Commit),
        2 => Ok(ObjectType::Tree),
        3 => Ok(ObjectType::Blob),
        4 => Ok(ObjectType::Tag),
        other => Err(StorageError::InternalInconsistency(format!(
            "unknown object type code {other}"
        ))),
    }
}

/// Decode a 20-byte binary key column.
pub fn oid_from_column(bytes: &[u8]) -> StoreResult<Oid> {
    if bytes.len() != OID_RAWSZ {
        return Err(StorageError::InternalInconsistency(format!(
            "object id column holds {} bytes, expected {OID_RAWSZ}",
            bytes.len()
        )));
    }
    Ok(Oid::from_bytes(bytes)?)
}

/// type and logical (inflated) size of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub kind: ObjectType,
    pub size: u64,
}

/// a fully read object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub kind: ObjectType,
    pub data: Vec<u8>,
}

impl RawObject {
    pub fn new(kind: ObjectType, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn header(&self) -> ObjectHeader {
        ObjectHeader {
            kind: self.kind,
            size: self.size(),
        }
    }
}

/// A short object id, in whole bytes.
///
/// Storage can only compare whole bytes, so an odd nibble count loses its
/// last hex digit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidPrefix {
    bytes: Vec<u8>,
    nibbles: usize,
}

impl OidPrefix {
    /// Take the first `nibbles` hex digits of `partial`.
    pub fn new(partial: &Oid, nibbles: usize) -> StoreResult<Self> {
        if nibbles == 0 || nibbles > OID_HEXSZ {
            return Err(StorageError::InvalidSpec(format!(
                "prefix length must be between 1 and {OID_HEXSZ} hex digits, got {nibbles}"
            )));
        }
        let len = nibbles / 2;
        Ok(Self {
            bytes: partial.as_bytes()[..len].to_vec(),
            nibbles,
        })
    }

    /// Parse a hex prefix such as `a1b2c3`.
    pub fn from_hex(hex: &str) -> StoreResult<Self> {
        let nibbles = hex.len();
        if nibbles == 0 || nibbles > OID_HEXSZ || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidSpec(format!("not an object id prefix: {hex}")));
        }
        let mut padded = hex.to_string();
        padded.extend(std::iter::repeat('0').take(OID_HEXSZ - nibbles));
        let partial = Oid::from_str(&padded)?;
        Self::new(&partial, nibbles)
    }

    /// bytes actually matched by storage
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// nibble count as requested by the caller
    pub fn nibbles(&self) -> usize {
        self.nibbles
    }

    /// nibble count storage compares on
    pub fn effective_nibbles(&self) -> usize {
        self.bytes.len() * 2
    }

    /// Lower bound (inclusive) of the key range sharing this prefix.
    pub fn lower_bound(&self) -> &[u8] {
        &self.bytes
    }

    /// Upper bound (exclusive) of the key range, or `None` when the range
    /// runs to the end of the key space (empty or all-`0xff` prefix).
    pub fn upper_bound(&self) -> Option<Vec<u8>> {
        let mut upper = self.bytes.clone();
        while let Some(last) = upper.pop() {
            if last != 0xff {
                upper.push(last + 1);
                return Some(upper);
            }
        }
        None
    }
}

impl fmt::Display for OidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.bytes {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// stored reference type code for a direct reference
pub const REF_DIRECT: u8 = 1;
/// stored reference type code for a symbolic reference
pub const REF_SYMBOLIC: u8 = 2;

/// what a reference points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReferenceTarget {
    /// an object id
    Direct(Oid),
    /// another reference name
    Symbolic(String),
}

/// a named reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    name: String,
    target: ReferenceTarget,
}

impl Reference {
    pub fn direct(name: impl Into<String>, oid: Oid) -> Self {
        Self {
            name: name.into(),
            target: ReferenceTarget::Direct(oid),
        }
    }

    pub fn symbolic(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ReferenceTarget::Symbolic(target.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &ReferenceTarget {
        &self.target
    }

    /// target object id, for direct references
    pub fn oid(&self) -> Option<Oid> {
        match &self.target {
            ReferenceTarget::Direct(oid) => Some(*oid),
            ReferenceTarget::Symbolic(_) => None,
        }
    }

    /// target name, for symbolic references
    pub fn symbolic_target(&self) -> Option<&str> {
        match &self.target {
            ReferenceTarget::Direct(_) => None,
            ReferenceTarget::Symbolic(name) => Some(name),
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self.target, ReferenceTarget::Symbolic(_))
    }

    pub(crate) fn type_code(&self) -> u8 {
        match self.target {
            ReferenceTarget::Direct(_) => REF_DIRECT,
            ReferenceTarget::Symbolic(_) => REF_SYMBOLIC,
        }
    }

    /// Rebuild a reference from its stored columns.
    pub(crate) fn from_columns(
        name: String,
        type_code: i64,
        oid: Option<&[u8]>,
        symref: Option<String>,
    ) -> StoreResult<Self> {
        match (type_code, oid, symref) {
            (code, Some(bytes), None) if code == i64::from(REF_DIRECT) => {
                Ok(Self::direct(name, oid_from_column(bytes)?))
            }
            (code, None, Some(target)) if code == i64::from(REF_SYMBOLIC) => {
                Ok(Self::symbolic(name, target))
            }
            (code, oid, symref) => Err(StorageError::InternalInconsistency(format!(
                "reference {name} has type {code} with oid {} and symref {}",
                if oid.is_some() { "set" } else { "null" },
                if symref.is_some() { "set" } else { "null" },
            ))),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            ReferenceTarget::Direct(oid) => write!(f, "{oid} {}", self.name),
            ReferenceTarget::Symbolic(target) => write!(f, "ref: {target} {}", self.name),
        }
    }
}

/// A validated reference glob.
///
/// `*` matches any run of characters. `%` and `?` are refused outright, since
/// both are wildcards to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefGlob(String);

impl RefGlob {
    pub fn new(glob: impl Into<String>) -> StoreResult<Self> {
        let glob = glob.into();
        if let Some(position) = glob.find(|c| c == '%' || c == '?') {
            return Err(StorageError::InvalidSpec(format!(
                "glob {glob:?} contains a reserved wildcard at position {position}"
            )));
        }
        Ok(Self(glob))
    }

    /// glob matching every reference
    pub fn all() -> Self {
        Self("*".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Translate to a `LIKE` pattern using `\` as the escape character.
    pub fn to_like_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.0.len() + 4);
        for c in self.0.chars() {
            match c {
                '*' => pattern.push('%'),
                '_' | '\\' => {
                    pattern.push('\\');
                    pattern.push(c);
                }
                c => pattern.push(c),
            }
        }
        pattern
    }

    /// Translate to a `GLOB` pattern. `GLOB` is always case-sensitive, and
    /// guards the `LIKE` match, which folds ASCII case.
    pub fn to_glob_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.0.len() + 4);
        for c in self.0.chars() {
            match c {
                '[' => pattern.push_str("[[]"),
                c => pattern.push(c),
            }
        }
        pattern
    }
}

impl fmt::Display for RefGlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
