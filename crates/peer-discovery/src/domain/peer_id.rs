//! Node identifiers and XOR distance.

use std::fmt;

use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha224};

/// 224-bit node identifier, derived as SHA-224 of the node's Ed25519
/// public key.
///
/// Bit index 0 is the most-significant bit of byte 0. Ordering is numeric
/// big-endian, matching the wire encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub [u8; 28]);

impl PeerId {
    /// Identifier width in bits.
    pub const BITS: usize = 224;

    /// Create a PeerId from raw bytes.
    pub fn new(bytes: [u8; 28]) -> Self {
        Self(bytes)
    }

    /// Derive the PeerId for an Ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(Sha224::digest(public_key).into())
    }

    /// Get the raw bytes of the PeerId.
    pub fn as_bytes(&self) -> &[u8; 28] {
        &self.0
    }

    /// Test bit `index`, where index 0 is the most-significant bit.
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < Self::BITS);
        (self.0[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &PeerId) -> Distance {
        let mut bytes = [0u8; 28];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Distance(bytes)
    }

    /// Draw a uniformly random identifier from the given CSPRNG.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 28];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Draw a random identifier whose bit 0 differs from `of`'s bit 0,
    /// i.e. one that lives in the opposite half of the identifier space.
    pub fn random_far_half<R: RngCore + ?Sized>(rng: &mut R, of: &PeerId) -> Self {
        loop {
            let id = Self::random(rng);
            if id.bit(0) != of.bit(0) {
                return id;
            }
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = PeerId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 28-byte identifier")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<PeerId, E> {
                let bytes: [u8; 28] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(PeerId(bytes))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<PeerId, E> {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

/// XOR distance between two PeerIds.
///
/// Distances compare as 224-bit unsigned integers. The metric admits no
/// ties: for a fixed target, two distinct ids always have distinct
/// distances.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; 28]);

impl Distance {
    /// Whether this is the zero distance (identical ids).
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}
