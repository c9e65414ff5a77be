use std::fmt;

use sha2::{Digest, Sha256};

/// Length in bytes of the digest carried by an [`ObjectId`].
pub const DIGEST_BYTES: usize = 32;

/// Optional one-byte tag distinguishing object flavors that share the hash
/// space.  The tag never appears in on-disk names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Suffix {
    #[default]
    None,
    /// File catalog objects.
    Catalog,
}

impl Suffix {
    fn tag(self) -> &'static str {
        match self {
            Suffix::None => "",
            Suffix::Catalog => "C",
        }
    }
}

/// Content hash identifying one object in the cache.
///
/// Ids are immutable value objects; the total ordering exists so they can
/// serve as map keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    digest: [u8; DIGEST_BYTES],
    suffix: Suffix,
}

impl ObjectId {
    pub fn from_digest(digest: [u8; DIGEST_BYTES]) -> Self {
        ObjectId {
            digest,
            suffix: Suffix::None,
        }
    }

    /// SHA-256 of `content`.
    pub fn hash_of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        ObjectId {
            digest: hasher.finalize().into(),
            suffix: Suffix::None,
        }
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 2 * DIGEST_BYTES || !hex.is_ascii() {
            return None;
        }
        let mut digest = [0u8; DIGEST_BYTES];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            digest[i] = ((hi << 4) | lo) as u8;
        }
        Some(ObjectId::from_digest(digest))
    }

    pub fn with_suffix(mut self, suffix: Suffix) -> Self {
        self.suffix = suffix;
        self
    }

    pub fn suffix(&self) -> Suffix {
        self.suffix
    }

    /// Plain hex rendering of the digest, without the suffix tag.
    pub fn hex(&self) -> String {
        self.digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Canonical on-disk name: two-character fan-out directory plus the
    /// remaining hex, suffix stripped.
    pub fn path_name(&self) -> String {
        let hex = self.hex();
        format!("{}/{}", &hex[..2], &hex[2..])
    }

    /// Fan-out path including the suffix tag, used in remote URLs.
    pub fn url_path(&self) -> String {
        format!("{}{}", self.path_name(), self.suffix.tag())
    }
}

impl fmt::Display for ObjectId {
    /// Display form: full hex plus the suffix tag.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.hex(), self.suffix.tag())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}
