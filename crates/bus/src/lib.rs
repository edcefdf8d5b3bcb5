//! Event bus participant.
//!
//! Joins a UDPv4 multicast group for service discovery, announces itself once
//! per second, tracks peer announcements with a 10 s staleness window, routes
//! outgoing events to peers whose advertised subscriptions match, and hands
//! incoming unicast events to a single local consumer.
//!
//! This bus is loopback-only: announcements travel with multicast TTL 0 and
//! the advertised host is always `127.0.0.1`.

mod participant;
mod socket;

pub use participant::{EventBus, EventBusConfig};

/// Errors from bus socket setup. Setup failures are fatal by design; the
/// receive and send loops recover from everything else by logging.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("could not create bus socket: {0}")]
    Socket(#[from] std::io::Error),
}
