//! Joining the network from a single known peer.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::domain::{Node, Peer, PeerId};
use crate::service::DiscoveryService;
use crate::wire::Request;

/// Where the instance stands in the join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Needed,
    InProgress,
    Done,
}

/// The shared bootstrap-state cell.
///
/// Transitions go through two atomic steps (see
/// [`BootstrapCell::acquire`]): a single check-and-modify cannot both wait
/// for an ongoing bootstrap and re-bootstrap a completed one.
pub(super) struct BootstrapCell {
    state: Mutex<BootstrapState>,
    changed: Notify,
}

enum Acquired {
    /// This caller owns the bootstrap and must complete or roll back.
    Owner,
    /// Another caller finished a bootstrap while we waited.
    AlreadyDone,
}

impl BootstrapCell {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(BootstrapState::Needed),
            changed: Notify::new(),
        }
    }

    pub(super) fn state(&self) -> BootstrapState {
        *self.state.lock().unwrap()
    }

    pub(super) fn set(&self, state: BootstrapState) {
        *self.state.lock().unwrap() = state;
        self.changed.notify_waiters();
    }

    /// Two-step acquisition.
    ///
    /// Step one: a completed bootstrap is flipped back to `Needed`, so a
    /// repeat call means "re-bootstrap". Step two: take ownership if the
    /// state is `Needed`; wait out another caller's `InProgress` and
    /// re-examine; report `AlreadyDone` if that caller succeeded
    /// meanwhile.
    async fn acquire(&self) -> Acquired {
        {
            let mut state = self.state.lock().unwrap();
            if *state == BootstrapState::Done {
                *state = BootstrapState::Needed;
            }
        }
        loop {
            // Register for wakeups before re-checking, so a transition
            // between the check and the await is not lost.
            let notified = self.changed.notified();
            {
                let mut state = self.state.lock().unwrap();
                match *state {
                    BootstrapState::Done => return Acquired::AlreadyDone,
                    BootstrapState::Needed => {
                        *state = BootstrapState::InProgress;
                        return Acquired::Owner;
                    }
                    BootstrapState::InProgress => {}
                }
            }
            notified.await;
        }
    }
}

/// Restores the pre-bootstrap state unless disarmed.
///
/// Runs on every early exit and on panic, so a failed or aborted
/// bootstrap always leaves the instance re-bootstrappable with its
/// original public port.
struct Rollback<'a> {
    service: &'a DiscoveryService,
    port_snapshot: Option<u16>,
    armed: bool,
}

impl Rollback<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        *self.service.public_port.write().unwrap() = self.port_snapshot;
        self.service.bootstrap.set(BootstrapState::Needed);
        debug!("bootstrap rolled back");
    }
}

impl DiscoveryService {
    /// Join the network via `initial_peer`.
    ///
    /// Idempotent under concurrent callers: exactly one proceeds, the
    /// rest wait and share its outcome. Returns true iff the instance is
    /// bootstrapped when the call returns. A completed bootstrap is
    /// redone when this is called again.
    pub async fn bootstrap(&self, initial_peer: Peer) -> bool {
        match self.bootstrap.acquire().await {
            Acquired::AlreadyDone => return true,
            Acquired::Owner => {}
        }

        let rollback = Rollback {
            service: self,
            port_snapshot: self.public_port(),
            armed: true,
        };
        info!(peer = %initial_peer, "bootstrapping");

        self.spawn_reachability_probe(initial_peer);
        let reached = self.join_via(initial_peer).await;

        if reached {
            rollback.disarm();
            self.bootstrap.set(BootstrapState::Done);
            info!(nodes = self.known_nodes(), "bootstrap complete");
            true
        } else {
            warn!(peer = %initial_peer, "bootstrap failed, initial peer unreachable");
            false
        }
    }

    /// The main join path: ping the initial peer, adopt it, then walk the
    /// network once toward ourselves and once toward the far half of the
    /// id space.
    async fn join_via(&self, initial_peer: Peer) -> bool {
        let ping = Request::Ping { return_port: None };
        let reply = match self.messenger.request(initial_peer, ping).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(peer = %initial_peer, %err, "initial ping failed");
                return false;
            }
        };

        {
            let mut table = self.table.lock().unwrap();
            table.insert_forced(&self.config, Node::new(reply.sender, initial_peer));
        }

        // Populates the neighborhood around our own id, then the half of
        // the tree our id does not live in.
        self.lookup(self.local_id).await;
        let far = PeerId::random_far_half(&mut rand::thread_rng(), &self.local_id);
        self.lookup(far).await;
        true
    }

    /// Ask the initial peer to answer to our announced port. If nothing
    /// comes back, we are not reachable there and stop announcing it.
    ///
    /// The probe is detached: `bootstrap` returns as soon as the plain
    /// ping path resolves, and a probe still in flight dangles until its
    /// response timeout expires.
    fn spawn_reachability_probe(&self, initial_peer: Peer) {
        let Some(port) = self.public_port() else {
            return;
        };
        let messenger = Arc::clone(&self.messenger);
        let public_port = Arc::clone(&self.public_port);
        let state = Arc::clone(&self.bootstrap);
        tokio::spawn(async move {
            let probe = Request::Ping {
                return_port: Some(port),
            };
            match messenger.request(initial_peer, probe).await {
                Ok(_) => debug!(port, "announced port is reachable"),
                Err(err) => {
                    // A failed bootstrap was already rolled back to the
                    // snapshotted port; do not clear it after the fact.
                    if state.state() == BootstrapState::Needed {
                        return;
                    }
                    *public_port.write().unwrap() = None;
                    warn!(port, %err, "announced port unreachable, clearing public port");
                }
            }
        });
    }
}
