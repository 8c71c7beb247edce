//! UDP transport: the socket loop, request/response correlation, and
//! response signing.
//!
//! One instance owns one socket. Outbound requests are correlated to
//! responses by RpcId; a response is only delivered to the waiting caller
//! after its source address, PeerId derivation, and Ed25519 signature all
//! check out. Anything else is dropped where it arrives and the caller
//! sees a plain timeout, so malformed or forged traffic never reaches the
//! discovery core.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{Peer, PeerId};
use crate::identity::{verify_signature, NodeIdentity};
use crate::ports::{CommError, Messenger, Reply, RequestHandler};
use crate::wire::{
    signing_bytes, Packet, PublicKeyBytes, Request, ResponsePayload, RpcId, SignatureBytes,
};

/// Generous bound for a discovery datagram; a full `ReturnNodes` with
/// k = 10 entries is well under 1 KiB.
const MAX_DATAGRAM: usize = 8192;

struct PendingRpc {
    peer: Peer,
    request: Request,
    tx: oneshot::Sender<Reply>,
}

/// UDP implementation of the [`Messenger`] port.
pub struct UdpMessenger {
    socket: UdpSocket,
    identity: Arc<NodeIdentity>,
    response_timeout: Duration,
    pending: Mutex<HashMap<RpcId, PendingRpc>>,
}

impl UdpMessenger {
    /// Bind a socket. Call [`UdpMessenger::start`] afterwards to serve
    /// inbound traffic; outbound requests work either way but will never
    /// see a response until the loop runs.
    pub async fn bind(
        addr: SocketAddr,
        identity: Arc<NodeIdentity>,
        response_timeout: Duration,
    ) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Self {
            socket,
            identity,
            response_timeout,
            pending: Mutex::new(HashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the socket loop, dispatching inbound requests to `handler`.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn RequestHandler>) -> JoinHandle<()> {
        let messenger = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match messenger.socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(%err, "udp receive failed");
                        continue;
                    }
                };
                let SocketAddr::V4(from) = from else {
                    debug!(%from, "dropping non-ipv4 datagram");
                    continue;
                };
                let from = Peer::from(from);
                let packet = match Packet::decode(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(err) => {
                        debug!(peer = %from, %err, "dropping undecodable datagram");
                        continue;
                    }
                };
                match packet {
                    Packet::Request { rpc_id, request } => {
                        let messenger = Arc::clone(&messenger);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            messenger
                                .serve_request(handler.as_ref(), from, rpc_id, request)
                                .await;
                        });
                    }
                    Packet::Response {
                        rpc_id,
                        public_key,
                        signature,
                        payload,
                    } => {
                        messenger.complete_pending(from, rpc_id, public_key, signature, payload);
                    }
                }
            }
        })
    }

    async fn serve_request(
        &self,
        handler: &dyn RequestHandler,
        from: Peer,
        rpc_id: RpcId,
        request: Request,
    ) {
        let reply = handler.handle(from, request.clone()).await;
        let message = match signing_bytes(&rpc_id, &request, &reply.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "failed to encode response for signing");
                return;
            }
        };
        let packet = Packet::Response {
            rpc_id,
            public_key: PublicKeyBytes(self.identity.public_key()),
            signature: SignatureBytes(self.identity.sign(&message)),
            payload: reply.payload,
        };
        match packet.encode() {
            Ok(bytes) => {
                if let Err(err) = self
                    .socket
                    .send_to(&bytes, reply.reply_to.to_socket_addr())
                    .await
                {
                    debug!(peer = %reply.reply_to, %err, "failed to send response");
                }
            }
            Err(err) => warn!(%err, "failed to encode response packet"),
        }
    }

    /// Deliver a response to the caller waiting on its RpcId, provided it
    /// comes from the queried address and its signature verifies.
    fn complete_pending(
        &self,
        from: Peer,
        rpc_id: RpcId,
        public_key: PublicKeyBytes,
        signature: SignatureBytes,
        payload: ResponsePayload,
    ) {
        let mut pending = self.pending.lock().unwrap();
        let Some(entry) = pending.get(&rpc_id) else {
            debug!(peer = %from, ?rpc_id, "response with no pending request");
            return;
        };
        if entry.peer != from {
            debug!(peer = %from, expected = %entry.peer, "response from unexpected peer");
            return;
        }
        let Ok(message) = signing_bytes(&rpc_id, &entry.request, &payload) else {
            return;
        };
        if !verify_signature(&public_key.0, &signature.0, &message) {
            debug!(peer = %from, "dropping response with bad signature");
            return;
        }
        let Some(entry) = pending.remove(&rpc_id) else {
            return;
        };
        let _ = entry.tx.send(Reply {
            sender: PeerId::from_public_key(&public_key.0),
            payload,
        });
    }
}

#[async_trait]
impl Messenger for UdpMessenger {
    async fn request(&self, peer: Peer, request: Request) -> Result<Reply, CommError> {
        let rpc_id = RpcId::random(&mut rand::thread_rng());
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                rpc_id,
                PendingRpc {
                    peer,
                    request: request.clone(),
                    tx,
                },
            );
        }

        let result = async {
            let bytes = Packet::Request { rpc_id, request }.encode()?;
            self.socket
                .send_to(&bytes, peer.to_socket_addr())
                .await
                .map_err(CommError::from)?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            self.pending.lock().unwrap().remove(&rpc_id);
            return Err(err);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CommError::Closed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&rpc_id);
                debug!(peer = %peer, "rpc timed out");
                Err(CommError::Timeout)
            }
        }
    }

    async fn send(&self, peer: Peer, packet: Packet) -> Result<(), CommError> {
        let bytes = packet.encode()?;
        self.socket
            .send_to(&bytes, peer.to_socket_addr())
            .await
            .map_err(CommError::from)?;
        Ok(())
    }
}
