//! CBOR wire messages.
//!
//! Every datagram is one [`Packet`]. Responses are signed: the Ed25519
//! signature covers the canonical CBOR encoding of
//! `(rpc_id, request, payload)`, binding the reply to the request it
//! answers. Signed payloads contain only tuples, arrays, and
//! fixed-layout structs, so their CBOR encoding is deterministic.

use std::fmt;
use std::net::Ipv4Addr;

use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::domain::{Node, Peer, PeerId};

/// Errors from encoding or decoding wire packets.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("cbor: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

/// 160-bit request/response correlation identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcId(pub [u8; 20]);

impl RpcId {
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 20];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcId(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// A request to another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Liveness probe. `return_port` redirects the `Pong` to a different
    /// UDP port on the sender's address (the self-reachability check).
    Ping { return_port: Option<u16> },
    /// Ask for the k nodes closest to `target_id`. Carries the sender's
    /// own id and announced port so the receiver can consider admitting
    /// the sender to its routing table.
    FindNode {
        peer_id: PeerId,
        public_port: Option<u16>,
        target_id: PeerId,
    },
}

/// The payload of a signed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Pong,
    ReturnNodes(Vec<WireNode>),
}

/// Wire form of a [`Node`]: `(peer_id, ipv4 as u32, port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNode(pub PeerId, pub u32, pub u16);

impl From<Node> for WireNode {
    fn from(node: Node) -> Self {
        Self(node.id, node.peer.addr.into(), node.peer.port)
    }
}

impl From<WireNode> for Node {
    fn from(wire: WireNode) -> Self {
        Node::new(wire.0, Peer::new(Ipv4Addr::from(wire.1), wire.2))
    }
}

/// One UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Request {
        rpc_id: RpcId,
        request: Request,
    },
    Response {
        rpc_id: RpcId,
        public_key: PublicKeyBytes,
        signature: SignatureBytes,
        payload: ResponsePayload,
    },
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

/// The bytes a response signature covers.
pub fn signing_bytes(
    rpc_id: &RpcId,
    request: &Request,
    payload: &ResponsePayload,
) -> Result<Vec<u8>, WireError> {
    Ok(serde_cbor::to_vec(&(rpc_id, request, payload))?)
}

/// 32-byte Ed25519 public key, encoded as a CBOR byte string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyBytes(pub [u8; 32]);

/// 64-byte Ed25519 signature, encoded as a CBOR byte string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; 64]);

struct FixedBytesVisitor<const N: usize>;

impl<'de, const N: usize> Visitor<'de> for FixedBytesVisitor<N> {
    type Value = [u8; N];

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {N}-byte string")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<[u8; N], E> {
        v.try_into().map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<[u8; N], E> {
        self.visit_bytes(&v)
    }
}

macro_rules! bytes_serde {
    ($name:ident, $len:expr) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer
                    .deserialize_bytes(FixedBytesVisitor::<$len>)
                    .map($name)
            }
        }
    };
}

bytes_serde!(PublicKeyBytes, 32);
bytes_serde!(SignatureBytes, 64);

impl Serialize for RpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for RpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer
            .deserialize_bytes(FixedBytesVisitor::<20>)
            .map(RpcId)
    }
}
