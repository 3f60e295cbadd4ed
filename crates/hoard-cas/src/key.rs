//! Content and path keys.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// BLAKE3 content hash of a blob, tagged with its compression mode.
///
/// The lowest bit of the last byte carries the mode, so identical bytes
/// stored compressed and uncompressed get different keys. Callers comparing
/// keys computed elsewhere must use the same mode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CasKey(pub [u8; 32]);

impl CasKey {
    pub const ZERO: CasKey = CasKey([0u8; 32]);

    const COMPRESSED_BIT: u8 = 1;

    pub fn from_hash(hash: blake3::Hash, compressed: bool) -> Self {
        CasKey(*hash.as_bytes()).as_compressed(compressed)
    }

    /// Same hash with the mode bit forced to `compressed`.
    pub fn as_compressed(mut self, compressed: bool) -> Self {
        if compressed {
            self.0[31] |= Self::COMPRESSED_BIT;
        } else {
            self.0[31] &= !Self::COMPRESSED_BIT;
        }
        self
    }

    pub fn is_compressed(&self) -> bool {
        self.0[31] & Self::COMPRESSED_BIT != 0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(CasKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for CasKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CasKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CasKey({})", &self.to_hex()[..16])
    }
}

/// Hash of a normalized file path, used by the path fast-path table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StringKey(pub [u8; 16]);

impl StringKey {
    /// Key of `path` with separators unified to `/` and optional case folding.
    pub fn from_path(path: &Path, case_insensitive: bool) -> Self {
        Self::from_str_normalized(&path.to_string_lossy(), case_insensitive)
    }

    pub fn from_str_normalized(path: &str, case_insensitive: bool) -> Self {
        let mut normalized = path.replace('\\', "/");
        if case_insensitive {
            normalized = normalized.to_lowercase();
        }
        let hash = blake3::hash(normalized.as_bytes());
        let mut key = [0u8; 16];
        key.copy_from_slice(&hash.as_bytes()[..16]);
        StringKey(key)
    }
}

impl fmt::Debug for StringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StringKey({})", hex::encode(self.0))
    }
}

/// Key of `data` under the given compression mode. Pure function of its inputs.
#[inline]
pub fn calculate_cas_key(data: &[u8], compressed: bool) -> CasKey {
    CasKey::from_hash(blake3::hash(data), compressed)
}
