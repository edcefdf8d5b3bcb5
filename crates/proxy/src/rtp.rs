//! RTP fan-out: one multicast listener, N per-peer delivery callbacks.
//!
//! The upstream publisher may restart and change SSRC at any time, so the
//! fanout synthesizes one stable SSRC at construction and publishes it to
//! every peer; the per-peer callbacks rewrite each packet before delivery.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

use crate::fanout::{Callback, Registry};

const STATS_PERIOD: Duration = Duration::from_secs(10);

pub type RtpCallback = Callback<Packet>;

pub struct RtpFanoutConfig {
    pub listen_addr: SocketAddr,
    pub read_buffer_size: usize,
    pub max_datagram_size: usize,
}

pub struct RtpFanout {
    config: RtpFanoutConfig,
    listener: Arc<UdpSocket>,
    ssrc: u32,
    callbacks: Registry<Packet>,
    packets_received: AtomicU32,
}

impl RtpFanout {
    /// Open the RTP listener. Joins the group when `listen_addr` is a
    /// multicast address, otherwise binds it directly. Fatal on failure.
    pub fn bind(config: RtpFanoutConfig) -> anyhow::Result<Arc<Self>> {
        let std_socket = open_listener(&config)
            .with_context(|| format!("could not listen for RTP at {}", config.listen_addr))?;
        let listener = UdpSocket::from_std(std_socket)?;
        let ssrc = synthesize_ssrc();
        info!(addr = %config.listen_addr, ssrc, "waiting for RTP packets");
        Ok(Arc::new(Self {
            config,
            listener: Arc::new(listener),
            ssrc,
            callbacks: Registry::new("rtp"),
            packets_received: AtomicU32::new(0),
        }))
    }

    /// The SSRC advertised to every peer for the life of this fanout.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Spawn the read loop and the stats ticker.
    pub fn start(self: &Arc<Self>) {
        let fanout = Arc::clone(self);
        tokio::spawn(async move { fanout.listen_loop().await });
        let fanout = Arc::clone(self);
        tokio::spawn(async move { fanout.stats_loop().await });
    }

    pub async fn register(&self, id: u64, callback: RtpCallback) {
        self.callbacks.register(id, callback).await;
    }

    pub async fn unregister(&self, id: u64) {
        self.callbacks.unregister(id).await;
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self) -> usize {
        self.callbacks.len().await
    }

    async fn listen_loop(&self) {
        let mut buf = vec![0u8; self.config.max_datagram_size];
        loop {
            let n = match self.listener.recv_from(&mut buf).await {
                Ok((n, _)) => n,
                Err(e) => {
                    warn!("rtp read failed: {e}");
                    continue;
                }
            };
            let mut datagram = &buf[..n];
            let packet = match Packet::unmarshal(&mut datagram) {
                Ok(p) => p,
                Err(e) => {
                    warn!("rtp unmarshal failed: {e}");
                    continue;
                }
            };
            self.packets_received.fetch_add(1, Ordering::Relaxed);
            self.callbacks.dispatch(packet).await;
        }
    }

    async fn stats_loop(&self) {
        let mut ticker = tokio::time::interval(STATS_PERIOD);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let received = self.packets_received.swap(0, Ordering::Relaxed);
            let subscribers = self.callbacks.len().await;
            info!(
                ssrc = self.ssrc,
                packets_received = received,
                subscribers,
                "rtp fanout stats"
            );
        }
    }
}

fn open_listener(config: &RtpFanoutConfig) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(config.read_buffer_size)?;
    match config.listen_addr {
        SocketAddr::V4(addr) if addr.ip().is_multicast() => {
            socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port()).into())?;
            socket.join_multicast_v4(addr.ip(), &Ipv4Addr::UNSPECIFIED)?;
        }
        addr => socket.bind(&addr.into())?,
    }
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Millisecond wall clock truncated to 32 bits. Stable for the process
/// lifetime, distinct across restarts — which is all an SSRC needs here.
fn synthesize_ssrc() -> u32 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis();
    millis as u32
}
