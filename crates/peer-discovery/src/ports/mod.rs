//! Trait seams between the discovery core and its collaborators.
//!
//! `outbound` is what the core requires (a way to send authenticated
//! RPCs); `inbound` is what the core offers (a handler for requests the
//! transport delivers).

mod inbound;
mod outbound;

pub use inbound::{InboundReply, RequestHandler};
pub use outbound::{CommError, Messenger, Reply};
