//! Event bus wire format.
//!
//! Every UDP datagram on the bus carries exactly one protobuf-encoded
//! message: datagrams arriving on the multicast group are [`Announce`]
//! records, datagrams arriving unicast on a participant's send socket are
//! [`Event`]s. Field tags are fixed here; the schema is shared with the
//! other services on the bus and must not be renumbered.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost::Message;
use prost_types::{Any, Timestamp};

/// Largest payload a single UDPv4 datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Event name prefix under which received announcements are republished.
pub const ANNOUNCEMENT_PREFIX: &str = "ipc/announcement/";

/// Type URL embedded in the `data` field of republished announcements.
pub const ANNOUNCE_TYPE_URL: &str = "type.googleapis.com/trestle.Announce";

/// The atomic unit on the event bus, addressed by a hierarchical topic name.
#[derive(Clone, PartialEq, Message)]
pub struct Event {
    /// Topic name, e.g. `"camera/front/frame"`.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Origin timestamp, set by the producer.
    #[prost(message, optional, tag = "2")]
    pub stamp: Option<Timestamp>,
    /// Receive timestamp, set by the bus on ingress.
    #[prost(message, optional, tag = "3")]
    pub recv_stamp: Option<Timestamp>,
    /// Opaque typed payload.
    #[prost(message, optional, tag = "4")]
    pub data: Option<Any>,
}

/// Service discovery record, broadcast once per second by each participant.
#[derive(Clone, PartialEq, Message)]
pub struct Announce {
    /// IPv4 literal of the announcing host. Always `"127.0.0.1"` on this bus
    /// revision (multicast TTL is 0, traffic never leaves the host).
    #[prost(string, tag = "1")]
    pub host: String,
    /// UDP port of the announcer's send socket. Peers unicast events here.
    #[prost(int32, tag = "2")]
    pub port: i32,
    /// Human-readable service name.
    #[prost(string, tag = "3")]
    pub service: String,
    #[prost(message, optional, tag = "4")]
    pub stamp: Option<Timestamp>,
    /// Set locally on ingress; drives the 10 s staleness eviction.
    #[prost(message, optional, tag = "5")]
    pub recv_stamp: Option<Timestamp>,
    /// Topic patterns this service wants delivered.
    #[prost(message, repeated, tag = "6")]
    pub subscriptions: Vec<Subscription>,
}

/// A single subscription pattern: a regular expression matched against event
/// names. Anchoring is not assumed.
#[derive(Clone, PartialEq, Message)]
pub struct Subscription {
    #[prost(string, tag = "1")]
    pub name: String,
}

impl Announce {
    /// Pack this announce into a protobuf `Any` for event payloads.
    pub fn to_any(&self) -> Any {
        Any {
            type_url: ANNOUNCE_TYPE_URL.to_string(),
            value: self.encode_to_vec(),
        }
    }
}

impl Event {
    /// Synthesize the `ipc/announcement/<service>` event for an announce.
    pub fn announcement(announce: &Announce) -> Self {
        Event {
            name: format!("{}{}", ANNOUNCEMENT_PREFIX, announce.service),
            stamp: announce.stamp.clone(),
            recv_stamp: announce.recv_stamp.clone(),
            data: Some(announce.to_any()),
        }
    }
}

/// Current wall-clock time as a protobuf timestamp.
pub fn now() -> Timestamp {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    Timestamp {
        seconds: elapsed.as_secs() as i64,
        nanos: elapsed.subsec_nanos() as i32,
    }
}

/// Age of `stamp` relative to `reference`, saturating to zero when the
/// stamp is in the future or missing fields are negative.
pub fn timestamp_age(stamp: &Timestamp, reference: &Timestamp) -> Duration {
    to_duration(reference).saturating_sub(to_duration(stamp))
}

fn to_duration(ts: &Timestamp) -> Duration {
    Duration::new(ts.seconds.max(0) as u64, ts.nanos.max(0) as u32)
}
