use std::fmt::{self, Debug, Display, Formatter};

use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::KEY_LENGTH;

/// A 160-bit identifier used for node IDs, RPC IDs, and content hashes.
///
/// The derived ordering is lexicographic over the bytes, which is the same
/// as comparing the IDs as big-endian integers.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Default, Copy)]
pub struct Key(pub [u8; KEY_LENGTH]);

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Key {
    pub fn new(data: [u8; KEY_LENGTH]) -> Self {
        Key(data)
    }

    /// Generates a random key from the OS entropy source.
    pub fn random() -> Self {
        let mut ret = Key::default();
        OsRng.fill_bytes(&mut ret.0);
        ret
    }

    /// Derives a key from a seed string: SHA-256 truncated to 20 bytes.
    pub fn from_seed(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut ret = Key::default();
        ret.0.copy_from_slice(&digest[..KEY_LENGTH]);
        ret
    }

    /// The content address of a byte payload: its SHA-1 hash.
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut ret = Key::default();
        ret.0.copy_from_slice(&digest);
        ret
    }

    /// Parses a 40-char hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|err| Error::Parse(format!("bad hex id {:?}: {}", s, err)))?;
        if bytes.len() != KEY_LENGTH {
            return Err(Error::Parse(format!(
                "bad id length: got {} bytes, want {}",
                bytes.len(),
                KEY_LENGTH
            )));
        }
        let mut ret = Key::default();
        ret.0.copy_from_slice(&bytes);
        Ok(ret)
    }

    /// Lowercase hex form, 40 chars.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another key.
    pub fn xor(&self, key: &Key) -> Key {
        let mut ret = Key::default();
        for (i, byte) in ret.0.iter_mut().enumerate() {
            *byte = self.0[i] ^ key.0[i];
        }
        ret
    }

    /// Index of the first 1 bit counting from the most significant bit of
    /// byte 0. Returns `KEY_LENGTH * 8` for the zero key; callers clamp to
    /// the last bucket.
    pub fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for i in 0..KEY_LENGTH {
            if self.0[i] == 0 {
                ret += 8
            } else {
                return ret + self.0[i].leading_zeros() as usize;
            }
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use super::Key;
    use crate::KEY_LENGTH;

    // generates a random key from [2^(160 - index - 1), 2^(160 - index))
    fn rand_in_range(index: usize) -> Key {
        let mut ret = Key::random();
        let bytes = index / 8;
        let bit = index % 8;
        for i in 0..bytes {
            ret.0[i] = 0;
        }
        ret.0[bytes] &= 0xFF >> bit;
        ret.0[bytes] |= 1 << (8 - bit - 1);
        ret
    }

    #[test]
    fn test_leading_zeros() {
        for i in 0..KEY_LENGTH * 8 {
            assert_eq!(rand_in_range(i).leading_zeros(), i);
        }
        assert_eq!(Key::default().leading_zeros(), KEY_LENGTH * 8);
    }

    #[test]
    fn test_distance_symmetry_and_identity() {
        for _ in 0..100 {
            let a = Key::random();
            let b = Key::random();
            assert_eq!(a.xor(&b), b.xor(&a));
            assert_eq!(a.xor(&a), Key::default());
        }
    }

    #[test]
    fn test_order_matches_big_endian_integers() {
        for _ in 0..100 {
            let a = Key::random();
            let b = Key::random();
            let an = BigUint::from_bytes_be(&a.0);
            let bn = BigUint::from_bytes_be(&b.0);
            assert_eq!(a.cmp(&b), an.cmp(&bn));
        }
    }

    #[test]
    fn test_hex_round_trip() {
        for _ in 0..20 {
            let key = Key::random();
            let hex = key.to_hex();
            assert_eq!(hex.len(), 40);
            assert!(hex.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
            assert_eq!(Key::from_hex(&hex).unwrap(), key);
        }
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(Key::from_hex("zz").is_err());
        assert!(Key::from_hex("abcd").is_err());
        assert!(Key::from_hex(&"a".repeat(42)).is_err());
    }

    #[test]
    fn test_seed_derivation_is_deterministic() {
        assert_eq!(Key::from_seed("same seed"), Key::from_seed("same seed"));
        assert_ne!(Key::from_seed("a"), Key::from_seed("b"));
    }

    #[test]
    fn test_content_hash_is_sha1() {
        let key = Key::hash(b"Hello");
        assert_eq!(key.to_hex(), "f7ff9e8b7bb2e09b70935a5d785e0cc5d9d0abf0");
    }
}
