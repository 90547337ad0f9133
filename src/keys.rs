//! # Key Material
//!
//! - [`Key`]: raw filesystem encryption key plus its content fingerprint
//! - [`KeyPiece`]: one secret share of a [`Key`], held by a cluster node
//!
//! ## Invariants
//!
//! - A key is 16, 24, or 32 bytes long (AES-128/192/256 sizes).
//! - The fingerprint is always BLAKE3(bytes). It is never accepted from the
//!   outside: constructing or deserializing a `Key` recomputes it.
//! - A `KeyPiece` is only meaningful together with its (generation, owner
//!   UUID) coordinates, which are held by the key-piece store.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of a key fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

/// Key lengths accepted by [`Key::new`] and [`Key::generate`].
pub const VALID_KEY_SIZES: [usize; 3] = [16, 24, 32];

pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// Returned when key material has a length other than 16, 24, or 32 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeySizeError(pub usize);

impl std::fmt::Display for KeySizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid key size {} (expected 16, 24 or 32 bytes)", self.0)
    }
}

impl std::error::Error for KeySizeError {}

fn check_size(size: usize) -> Result<(), KeySizeError> {
    if VALID_KEY_SIZES.contains(&size) {
        Ok(())
    } else {
        Err(KeySizeError(size))
    }
}

/// Filesystem encryption key.
///
/// Serializes as its raw bytes only; the fingerprint is rebuilt on load.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "KeyBytes", into = "KeyBytes")]
pub struct Key {
    bytes: Vec<u8>,
    fingerprint: Fingerprint,
}

impl Key {
    pub fn new(bytes: Vec<u8>) -> Result<Self, KeySizeError> {
        check_size(bytes.len())?;
        let fingerprint = *blake3::hash(&bytes).as_bytes();
        Ok(Self { bytes, fingerprint })
    }

    /// Generate fresh random key material of the given size.
    pub fn generate(size: usize) -> Result<Self, KeySizeError> {
        check_size(size)?;
        let mut bytes = vec![0u8; size];
        OsRng.fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("len", &self.bytes.len())
            .field("fingerprint", &hex::encode(&self.fingerprint[..8]))
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(transparent)]
struct KeyBytes(Vec<u8>);

impl TryFrom<KeyBytes> for Key {
    type Error = KeySizeError;

    fn try_from(raw: KeyBytes) -> Result<Self, Self::Error> {
        Key::new(raw.0)
    }
}

impl From<Key> for KeyBytes {
    fn from(key: Key) -> Self {
        KeyBytes(key.bytes)
    }
}

/// One share of a split [`Key`].
///
/// `prime` is the big-endian encoding of the sharing scheme's modulus and
/// `seq` the share's index within its generation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPiece {
    pub data: Vec<u8>,
    pub parent_fingerprint: Fingerprint,
    pub prime: Vec<u8>,
    pub seq: i64,
}

impl std::fmt::Debug for KeyPiece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPiece")
            .field("parent", &hex::encode(&self.parent_fingerprint[..8]))
            .field("seq", &self.seq)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_permitted_sizes() {
        for size in VALID_KEY_SIZES {
            let key = Key::new(vec![7u8; size]).expect("valid size must be accepted");
            assert_eq!(key.bytes().len(), size);
        }
    }

    #[test]
    fn rejects_other_sizes() {
        for size in [0usize, 1, 15, 17, 23, 25, 31, 33, 64] {
            assert_eq!(Key::new(vec![0u8; size]), Err(KeySizeError(size)));
            assert_eq!(Key::generate(size).err(), Some(KeySizeError(size)));
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Key::new(vec![42u8; 32]).unwrap();
        let b = Key::new(vec![42u8; 32]).unwrap();
        let c = Key::new(vec![43u8; 32]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn generated_keys_differ() {
        let a = Key::generate(32).unwrap();
        let b = Key::generate(32).unwrap();
        assert_ne!(a.bytes(), b.bytes());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn deserialize_recomputes_fingerprint() {
        let key = Key::generate(24).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        let restored: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.fingerprint(), key.fingerprint());
        assert_eq!(restored, key);
    }

    #[test]
    fn deserialize_rejects_bad_length() {
        let json = serde_json::to_string(&vec![1u8; 20]).unwrap();
        assert!(serde_json::from_str::<Key>(&json).is_err());
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let key = Key::new(vec![0xAB; 16]).unwrap();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("171, 171"));
        assert!(rendered.contains("len: 16"));
    }
}
