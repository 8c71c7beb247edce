//! Driven port: outbound request/response messaging.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Peer, PeerId};
use crate::wire::{Packet, Request, ResponsePayload, WireError};

/// Errors from an RPC attempt.
#[derive(Debug, Error)]
pub enum CommError {
    /// No verified response arrived within the response timeout.
    #[error("rpc timed out")]
    Timeout,
    /// The messenger is shutting down and dropped the pending call.
    #[error("messenger closed")]
    Closed,
    #[error("socket i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire encoding: {0}")]
    Codec(#[from] WireError),
}

/// A verified response.
///
/// `sender` is derived from the public key the response was signed with
/// (SHA-224 of the key), so a successful RPC authenticates the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub sender: PeerId,
    pub payload: ResponsePayload,
}

/// Abstract interface for sending authenticated RPCs.
///
/// Implementations correlate responses by RpcId, enforce the response
/// timeout, and verify the Ed25519 signature plus the PeerId derivation
/// before a [`Reply`] is handed back. Unverifiable responses are dropped
/// and surface as [`CommError::Timeout`].
///
/// Implementations must be `Send + Sync`: lookups issue requests from
/// many tasks at once.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send `request` to `peer` and await its verified response.
    async fn request(&self, peer: Peer, request: Request) -> Result<Reply, CommError>;

    /// Emit one packet to `peer`, fire-and-forget: no pending reply is
    /// registered and any response is dropped at the receiver's
    /// correlation layer.
    async fn send(&self, peer: Peer, packet: Packet) -> Result<(), CommError>;
}
