//! # InfoHash
//!
//! Fixed-width opaque identifiers for the DHT key space.
//!
//! An [`InfoHash`] is a 32-byte BLAKE3 hash used both as a storage key and
//! as a node id. Node ids are derived deterministically from public keys
//! (see `crypto`), so equality of an id with the hash of a key is what
//! anchors trust in the overlay.

use std::cmp::Ordering;

/// Width of the DHT key space in bytes.
pub const HASH_LEN: usize = 32;

/// A 32-byte identifier in the DHT key space.
///
/// Equality and lexicographic order are defined on the raw bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash([u8; HASH_LEN]);

impl InfoHash {
    /// Hash arbitrary bytes into the key space.
    pub fn get(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// A uniformly random id.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; HASH_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// The all-zero id, used as the absent-recipient placeholder on the wire.
    #[inline]
    pub fn zero() -> Self {
        Self([0u8; HASH_LEN])
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Number of leading bits shared by `self` and `other`.
    pub fn common_bits(&self, other: &InfoHash) -> u32 {
        let mut bits = 0u32;
        for i in 0..HASH_LEN {
            let x = self.0[i] ^ other.0[i];
            if x == 0 {
                bits += 8;
            } else {
                bits += x.leading_zeros();
                break;
            }
        }
        bits
    }

    /// XOR distance to `other` in the Kademlia metric.
    pub fn xor_distance(&self, other: &InfoHash) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != HASH_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; HASH_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Compare two XOR distances lexicographically.
#[inline]
pub fn distance_cmp(a: &[u8; HASH_LEN], b: &[u8; HASH_LEN]) -> Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InfoHash({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; HASH_LEN]> for InfoHash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for InfoHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
