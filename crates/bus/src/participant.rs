use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;
use regex::Regex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trestle_protocol::wire::{self, Announce, Event, Subscription, MAX_DATAGRAM_SIZE};

use crate::socket;
use crate::BusError;

/// How often we announce ourselves to the group.
const ANNOUNCE_PERIOD: Duration = Duration::from_secs(1);

/// Announcements older than this (by local receive time) are evicted.
const STALE_AFTER: Duration = Duration::from_secs(10);

/// Construction options for a bus participant.
pub struct EventBusConfig {
    /// Group address announcements are sent to and received from.
    pub multicast_group: SocketAddrV4,
    /// Name advertised in self-announcements.
    pub service_name: String,
    /// Handoff for incoming events. When absent, incoming events still
    /// update the state table but are not forwarded anywhere.
    pub event_sink: Option<mpsc::Sender<Event>>,
    /// Republish every received announcement on the sink as an
    /// `ipc/announcement/<service>` event.
    pub publish_announcements: bool,
    /// Regex patterns advertised in self-announcements. Peers unicast us
    /// only the events whose names match one of these.
    pub subscriptions: Vec<String>,
}

/// Peer announcements plus the memoized subscription-regex cache. Both live
/// under one mutex: every cache lookup happens inside a recipients snapshot.
/// Compile failures are cached as `None` so a bad pattern is logged once,
/// not once per event.
#[derive(Default)]
struct PeerTable {
    announcements: HashMap<String, Announce>,
    patterns: HashMap<String, Option<Regex>>,
}

/// A participant on the UDP-multicast event bus.
///
/// Owns two sockets: the shared group receiver (announcements in) and an
/// ephemeral sender that is also the unicast event inbox (peers learn its
/// port from our announcements). See the crate docs for the full protocol.
pub struct EventBus {
    config: EventBusConfig,
    peers: Mutex<PeerTable>,
    state: Mutex<HashMap<String, Event>>,
    recv_sock: Arc<UdpSocket>,
    send_sock: Arc<UdpSocket>,
    send_port: u16,
    local_addrs: HashSet<IpAddr>,
}

impl EventBus {
    /// Set up both bus sockets. Socket errors here are fatal; nothing is
    /// spawned until [`EventBus::start`].
    pub fn bind(config: EventBusConfig) -> Result<Arc<Self>, BusError> {
        let recv_sock = socket::multicast_receiver(config.multicast_group)?;
        let send_sock = socket::event_sender()?;
        Self::with_sockets(config, recv_sock, send_sock)
    }

    /// Assemble a participant around already-bound sockets. Split out from
    /// [`EventBus::bind`] so tests can substitute plain loopback sockets for
    /// the multicast pair.
    fn with_sockets(
        config: EventBusConfig,
        recv_sock: UdpSocket,
        send_sock: UdpSocket,
    ) -> Result<Arc<Self>, BusError> {
        let send_port = send_sock.local_addr()?.port();
        info!(
            group = %config.multicast_group,
            send_port,
            service = %config.service_name,
            "event bus participant ready"
        );
        Ok(Arc::new(Self {
            config,
            peers: Mutex::new(PeerTable::default()),
            state: Mutex::new(HashMap::new()),
            recv_sock: Arc::new(recv_sock),
            send_sock: Arc::new(send_sock),
            send_port,
            local_addrs: socket::local_addresses(),
        }))
    }

    /// Spawn the three long-running loops: announce, announcement-receive,
    /// event-receive.
    pub fn start(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        tokio::spawn(async move { bus.announce_loop().await });
        let bus = Arc::clone(self);
        tokio::spawn(async move { bus.announcement_loop().await });
        let bus = Arc::clone(self);
        tokio::spawn(async move { bus.event_loop().await });
    }

    /// Port of the send socket, as advertised to peers.
    pub fn send_port(&self) -> u16 {
        self.send_port
    }

    /// Snapshot of the current announcements table, keyed `"ip:port"`.
    pub fn announcements(&self) -> HashMap<String, Announce> {
        let table = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        table.announcements.clone()
    }

    /// Snapshot of the last event received per topic name.
    pub fn state(&self) -> HashMap<String, Event> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.clone()
    }

    /// Unicast `event` to every peer with a matching subscription.
    ///
    /// The recipient set is snapshotted under the announcements mutex, the
    /// event is serialized once, and transmission happens outside the lock.
    /// An event matching no subscription never leaves the host; the return
    /// value is the number of datagrams written.
    pub async fn send_event(&self, event: &Event) -> usize {
        let recipients = self.recipients(&event.name);
        if recipients.is_empty() {
            return 0;
        }
        let bytes = event.encode_to_vec();
        let mut sent = 0;
        for addr in recipients {
            match self.send_sock.send_to(&bytes, addr).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(%addr, name = %event.name, "could not send event: {e}"),
            }
        }
        sent
    }

    /// Addresses of every fresh peer with a subscription matching `name`.
    fn recipients(&self, name: &str) -> Vec<SocketAddr> {
        let mut table = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let PeerTable {
            announcements,
            patterns,
        } = &mut *table;

        let mut out = Vec::new();
        for announce in announcements.values() {
            let matched = announce.subscriptions.iter().any(|sub| {
                let compiled = patterns
                    .entry(sub.name.clone())
                    .or_insert_with(|| match Regex::new(&sub.name) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!(pattern = %sub.name, "invalid subscription regex: {e}");
                            None
                        }
                    });
                compiled.as_ref().is_some_and(|re| re.is_match(name))
            });
            if !matched {
                continue;
            }
            match announce.host.parse::<IpAddr>() {
                Ok(ip) => out.push(SocketAddr::new(ip, announce.port as u16)),
                Err(_) => warn!(host = %announce.host, "announce has unparseable host"),
            }
        }
        out
    }

    async fn announce_loop(&self) {
        let mut ticker = tokio::time::interval(ANNOUNCE_PERIOD);
        let group = SocketAddr::V4(self.config.multicast_group);
        loop {
            ticker.tick().await;
            let bytes = self.self_announce().encode_to_vec();
            if let Err(e) = self.send_sock.send_to(&bytes, group).await {
                warn!("could not send announcement: {e}");
            }
            self.evict_stale();
        }
    }

    fn self_announce(&self) -> Announce {
        Announce {
            host: "127.0.0.1".to_string(),
            port: self.send_port as i32,
            service: self.config.service_name.clone(),
            stamp: Some(wire::now()),
            recv_stamp: None,
            subscriptions: self
                .config
                .subscriptions
                .iter()
                .map(|name| Subscription { name: name.clone() })
                .collect(),
        }
    }

    /// Drop table entries whose receive stamp is older than [`STALE_AFTER`].
    fn evict_stale(&self) {
        let now = wire::now();
        let mut table = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        table.announcements.retain(|key, announce| {
            let fresh = announce
                .recv_stamp
                .as_ref()
                .is_some_and(|ts| wire::timestamp_age(ts, &now) <= STALE_AFTER);
            if !fresh {
                info!(peer = %key, "evicting stale announcement");
            }
            fresh
        });
    }

    async fn announcement_loop(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, src) = match self.recv_sock.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("announcement receive failed: {e}");
                    continue;
                }
            };
            if let Some(event) = self.handle_announcement(&buf[..n], src) {
                self.forward(event).await;
            }
        }
    }

    /// Filter, parse, and record one announcement datagram. Returns the
    /// republication event when one should go to the sink.
    fn handle_announcement(&self, datagram: &[u8], src: SocketAddr) -> Option<Event> {
        // Our own announcements come back via multicast loopback.
        if src.port() == self.send_port {
            debug!(%src, "ignoring self-announcement");
            return None;
        }
        if !socket::is_local(src.ip(), &self.local_addrs) {
            debug!(%src, "dropping announcement from non-local source");
            return None;
        }

        let mut announce = match Announce::decode(datagram) {
            Ok(a) => a,
            Err(e) => {
                warn!(%src, "announcement parsing failed: {e}");
                return None;
            }
        };
        if announce.port != i32::from(src.port()) {
            warn!(
                %src,
                announced_port = announce.port,
                "sender port does not match announcement, dropping"
            );
            return None;
        }

        announce.host = src.ip().to_string();
        announce.recv_stamp = Some(wire::now());

        let key = format!("{}:{}", src.ip(), src.port());
        debug!(peer = %key, service = %announce.service, "received announcement");
        {
            let mut table = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            table.announcements.insert(key, announce.clone());
        }

        if self.config.publish_announcements && self.config.event_sink.is_some() {
            Some(Event::announcement(&announce))
        } else {
            None
        }
    }

    async fn event_loop(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let n = match self.send_sock.recv_from(&mut buf).await {
                Ok((n, _)) => n,
                Err(e) => {
                    warn!("event receive failed: {e}");
                    continue;
                }
            };
            if let Some(event) = self.handle_event(&buf[..n]) {
                self.forward(event).await;
            }
        }
    }

    /// Parse one unicast event datagram, stamp it, and record it in the
    /// state table. Returns the event for forwarding to the sink.
    fn handle_event(&self, datagram: &[u8]) -> Option<Event> {
        let mut event = match Event::decode(datagram) {
            Ok(e) => e,
            Err(e) => {
                warn!("event parsing failed: {e}");
                return None;
            }
        };
        event.recv_stamp = Some(wire::now());
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.insert(event.name.clone(), event.clone());
        }
        Some(event)
    }

    async fn forward(&self, event: Event) {
        if let Some(sink) = &self.config.event_sink {
            if sink.send(event).await.is_err() {
                warn!("event sink closed, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::Timestamp;

    async fn loopback_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn test_bus(sink: Option<mpsc::Sender<Event>>, publish: bool) -> Arc<EventBus> {
        let config = EventBusConfig {
            multicast_group: "239.20.20.21:10000".parse().unwrap(),
            service_name: "test-service".to_string(),
            event_sink: sink,
            publish_announcements: publish,
            subscriptions: vec!["test/.*".to_string()],
        };
        EventBus::with_sockets(config, loopback_socket().await, loopback_socket().await).unwrap()
    }

    fn announce_from(port: u16, subscriptions: &[&str]) -> Announce {
        Announce {
            host: "127.0.0.1".to_string(),
            port: i32::from(port),
            service: "peer".to_string(),
            stamp: Some(wire::now()),
            recv_stamp: None,
            subscriptions: subscriptions
                .iter()
                .map(|s| Subscription {
                    name: (*s).to_string(),
                })
                .collect(),
        }
    }

    fn src(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn self_announcement_is_dropped() {
        let bus = test_bus(None, false).await;
        let own_port = bus.send_port();
        let bytes = announce_from(own_port, &[]).encode_to_vec();

        assert!(bus.handle_announcement(&bytes, src(own_port)).is_none());
        assert!(bus.announcements().is_empty(), "self must never be tabled");
    }

    #[tokio::test]
    async fn non_local_source_is_dropped() {
        let bus = test_bus(None, false).await;
        let bytes = announce_from(4242, &[]).encode_to_vec();
        let remote = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 1)), 4242);

        assert!(bus.handle_announcement(&bytes, remote).is_none());
        assert!(bus.announcements().is_empty());
    }

    #[tokio::test]
    async fn port_mismatch_is_dropped() {
        let bus = test_bus(None, false).await;
        let bytes = announce_from(4242, &[]).encode_to_vec();

        assert!(bus.handle_announcement(&bytes, src(5353)).is_none());
        assert!(bus.announcements().is_empty());
    }

    #[tokio::test]
    async fn valid_announcement_is_tabled() {
        let bus = test_bus(None, false).await;
        let bytes = announce_from(4242, &["foo/.*"]).encode_to_vec();

        assert!(bus.handle_announcement(&bytes, src(4242)).is_none());
        let table = bus.announcements();
        let entry = table.get("127.0.0.1:4242").expect("entry keyed ip:port");
        assert_eq!(entry.host, "127.0.0.1");
        assert_eq!(entry.port, 4242);
        assert!(entry.recv_stamp.is_some(), "recv_stamp set on ingress");
        assert_eq!(entry.subscriptions[0].name, "foo/.*");
    }

    #[tokio::test]
    async fn malformed_announcement_is_dropped_not_fatal() {
        let bus = test_bus(None, false).await;
        assert!(bus.handle_announcement(&[0x00], src(4242)).is_none());
        assert!(bus.announcements().is_empty());
        // The bus keeps accepting traffic afterwards
        let bytes = announce_from(4242, &[]).encode_to_vec();
        bus.handle_announcement(&bytes, src(4242));
        assert_eq!(bus.announcements().len(), 1);
    }

    #[tokio::test]
    async fn announcement_republication_respects_config() {
        let (tx, _rx) = mpsc::channel(8);
        let bus = test_bus(Some(tx), true).await;
        let bytes = announce_from(4242, &[]).encode_to_vec();

        let event = bus
            .handle_announcement(&bytes, src(4242))
            .expect("publish_announcements should synthesize an event");
        assert_eq!(event.name, "ipc/announcement/peer");

        let (tx, _rx) = mpsc::channel(8);
        let quiet = test_bus(Some(tx), false).await;
        assert!(quiet.handle_announcement(&bytes, src(4242)).is_none());
    }

    #[tokio::test]
    async fn stale_entries_are_evicted() {
        let bus = test_bus(None, false).await;

        let mut stale = announce_from(1111, &[]);
        let now = wire::now();
        stale.recv_stamp = Some(Timestamp {
            seconds: now.seconds - 11,
            nanos: now.nanos,
        });
        let mut fresh = announce_from(2222, &[]);
        fresh.recv_stamp = Some(now);
        {
            let mut table = bus.peers.lock().unwrap();
            table.announcements.insert("127.0.0.1:1111".into(), stale);
            table.announcements.insert("127.0.0.1:2222".into(), fresh);
        }

        bus.evict_stale();

        let table = bus.announcements();
        assert!(!table.contains_key("127.0.0.1:1111"), "11 s old entry gone");
        assert!(table.contains_key("127.0.0.1:2222"), "fresh entry stays");
    }

    #[tokio::test]
    async fn recipients_follow_subscriptions() {
        let bus = test_bus(None, false).await;
        {
            let mut table = bus.peers.lock().unwrap();
            let mut a = announce_from(1111, &["foo/.*"]);
            a.recv_stamp = Some(wire::now());
            table.announcements.insert("127.0.0.1:1111".into(), a);
            let mut b = announce_from(2222, &[".*"]);
            b.recv_stamp = Some(wire::now());
            table.announcements.insert("127.0.0.1:2222".into(), b);
            let mut c = announce_from(3333, &[]);
            c.recv_stamp = Some(wire::now());
            table.announcements.insert("127.0.0.1:3333".into(), c);
        }

        let mut ports: Vec<u16> = bus
            .recipients("foo/bar")
            .iter()
            .map(|a| a.port())
            .collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![1111, 2222], "both matching peers, not the bare one");

        let ports: Vec<u16> = bus.recipients("baz").iter().map(|a| a.port()).collect();
        assert_eq!(ports, vec![2222], "only the catch-all subscriber");
    }

    #[tokio::test]
    async fn invalid_subscription_regex_is_ignored() {
        let bus = test_bus(None, false).await;
        {
            let mut table = bus.peers.lock().unwrap();
            let mut a = announce_from(1111, &["[invalid", "foo/.*"]);
            a.recv_stamp = Some(wire::now());
            table.announcements.insert("127.0.0.1:1111".into(), a);
        }
        // The broken pattern neither matches nor poisons the valid one
        assert_eq!(bus.recipients("foo/bar").len(), 1);
        assert!(bus.recipients("bar").is_empty());
    }

    #[tokio::test]
    async fn send_event_without_recipients_writes_nothing() {
        let bus = test_bus(None, false).await;
        let event = Event {
            name: "foo/bar".to_string(),
            ..Default::default()
        };
        assert_eq!(bus.send_event(&event).await, 0);
    }

    #[tokio::test]
    async fn send_event_unicasts_to_matching_peer() {
        let bus = test_bus(None, false).await;
        let receiver = loopback_socket().await;
        let peer_port = receiver.local_addr().unwrap().port();
        {
            let mut table = bus.peers.lock().unwrap();
            let mut a = announce_from(peer_port, &["foo/.*"]);
            a.recv_stamp = Some(wire::now());
            table
                .announcements
                .insert(format!("127.0.0.1:{peer_port}"), a);
        }

        let event = Event {
            name: "foo/bar".to_string(),
            stamp: Some(wire::now()),
            ..Default::default()
        };
        assert_eq!(bus.send_event(&event).await, 1, "exactly one datagram");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .expect("datagram should arrive")
            .unwrap();
        let received = Event::decode(&buf[..n]).unwrap();
        assert_eq!(received, event, "wire round-trip preserves the event");

        let miss = Event {
            name: "baz".to_string(),
            ..Default::default()
        };
        assert_eq!(bus.send_event(&miss).await, 0, "no subscription, no send");
    }

    #[tokio::test]
    async fn incoming_events_update_state_and_forward() {
        let (tx, mut rx) = mpsc::channel(8);
        let bus = test_bus(Some(tx), false).await;

        let event = Event {
            name: "robot/pose".to_string(),
            stamp: Some(wire::now()),
            ..Default::default()
        };
        let forwarded = bus
            .handle_event(&event.encode_to_vec())
            .expect("valid event accepted");
        bus.forward(forwarded).await;

        let state = bus.state();
        let stored = state.get("robot/pose").expect("state keyed by name");
        assert!(stored.recv_stamp.is_some(), "bus stamps events on ingress");

        let delivered = rx.recv().await.expect("sink receives the event");
        assert_eq!(delivered.name, "robot/pose");
    }

    #[tokio::test]
    async fn newer_event_overwrites_state() {
        let bus = test_bus(None, false).await;
        let first = Event {
            name: "robot/pose".to_string(),
            stamp: Some(Timestamp { seconds: 1, nanos: 0 }),
            ..Default::default()
        };
        let second = Event {
            name: "robot/pose".to_string(),
            stamp: Some(Timestamp { seconds: 2, nanos: 0 }),
            ..Default::default()
        };
        bus.handle_event(&first.encode_to_vec());
        bus.handle_event(&second.encode_to_vec());

        let state = bus.state();
        assert_eq!(state.len(), 1);
        assert_eq!(
            state.get("robot/pose").unwrap().stamp,
            Some(Timestamp { seconds: 2, nanos: 0 }),
            "last write wins"
        );
    }

    #[tokio::test]
    async fn self_announce_advertises_subscriptions() {
        let bus = test_bus(None, false).await;
        let announce = bus.self_announce();
        assert_eq!(announce.host, "127.0.0.1");
        assert_eq!(announce.port, i32::from(bus.send_port()));
        assert_eq!(announce.service, "test-service");
        assert_eq!(announce.subscriptions.len(), 1);
        assert_eq!(announce.subscriptions[0].name, "test/.*");
    }
}
