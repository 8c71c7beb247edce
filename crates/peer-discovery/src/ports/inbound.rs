//! Driving port: handling requests delivered by the transport.

use async_trait::async_trait;

use crate::domain::Peer;
use crate::wire::{Request, ResponsePayload};

/// The handler's answer to an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReply {
    pub payload: ResponsePayload,
    /// Where to send the response. Differs from the request's source only
    /// for a `Ping` carrying a return port (the self-reachability probe).
    pub reply_to: Peer,
}

/// Serves `FindNode` and `Ping` requests.
///
/// The transport may invoke this from many tasks concurrently; the
/// response is signed and emitted by the transport, not the handler.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, from: Peer, request: Request) -> InboundReply;
}
