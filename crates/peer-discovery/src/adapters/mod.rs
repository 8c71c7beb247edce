//! Concrete collaborator implementations.

mod udp;

pub use udp::UdpMessenger;
