//! Node identity: the long-term Ed25519 keypair and the PeerId derived
//! from it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::domain::PeerId;

/// A node's long-term signing identity.
///
/// The PeerId is SHA-224 of the 32-byte Ed25519 public key, so possession
/// of the signing key is what binds a node to its position in the id
/// space.
pub struct NodeIdentity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Generate a fresh identity from the OS CSPRNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild an identity from a stored 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = PeerId::from_public_key(&signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            peer_id,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The 32-byte public key carried in signed responses.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a response payload (deterministic, no RNG needed).
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature carried by a response.
///
/// Returns false for malformed keys as well as bad signatures; callers
/// treat both as an unverifiable packet and drop it.
pub fn verify_signature(public_key: &[u8; 32], signature: &[u8; 64], message: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    verifying_key.verify(message, &signature).is_ok()
}
