//! Per-peer WebRTC session lifecycle.
//!
//! One `add_peer` call per connecting browser: negotiate a non-trickle
//! answer from its SDP offer, wire the RTP fanout into a sendonly H.264
//! track, and run the detached data channel in both directions. Teardown is
//! driven by whichever fires first, ICE reaching Closed or the data-channel
//! read loop failing; both paths funnel into the same idempotent cleanup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use prost::Message;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data::data_channel::DataChannel;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use trestle_protocol::wire::{self, Announce, Event};

use crate::events::EventFanout;
use crate::rtp::RtpFanout;

/// Service name peers see in our periodic self-announcements.
const PROXY_SERVICE: &str = "webrtc-proxy";

/// Fixed frame size for reads from the detached data channel.
const MESSAGE_SIZE: usize = 1024;

/// How many self-announcements to write back-to-back when a channel opens.
/// Keeps the detached channel's send window filled so the peer observes our
/// presence before the first ticker tick; the loop exits on first error.
const ANNOUNCE_PRIME_COUNT: usize = 100;

const ANNOUNCE_PERIOD: Duration = Duration::from_secs(1);
const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(60);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("remote peer does not support H264")]
    UnsupportedCodec,
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
    #[error("no local description after ICE gathering")]
    NoLocalDescription,
}

/// H264 parameters lifted from an SDP offer.
#[derive(Debug, PartialEq, Eq)]
struct NegotiatedCodec {
    payload_type: u8,
    fmtp: String,
}

/// Owns the per-peer sessions and their registrations in both fanouts.
pub struct PeerManager {
    rtp: Arc<RtpFanout>,
    events: Arc<EventFanout>,
    peers: Mutex<HashMap<u64, Arc<RTCPeerConnection>>>,
}

impl PeerManager {
    pub fn new(rtp: Arc<RtpFanout>, events: Arc<EventFanout>) -> Arc<Self> {
        Arc::new(Self {
            rtp,
            events,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Accept an SDP offer from a new peer, wire it into both fanouts, and
    /// return the non-trickle SDP answer.
    pub async fn add_peer(
        self: &Arc<Self>,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, PeerError> {
        let peer_id = next_peer_id();
        info!(peer_id, "adding peer");

        // The browser picks the dynamic payload type; our answer must reuse
        // it, so the media engine is populated from the offer rather than
        // from defaults.
        let codec = h264_codec_from_sdp(&offer.sdp).ok_or(PeerError::UnsupportedCodec)?;
        debug!(
            peer_id,
            payload_type = codec.payload_type,
            fmtp = %codec.fmtp,
            "found H264 in offer"
        );

        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: codec.fmtp.clone(),
            rtcp_feedback: vec![],
        };

        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: capability.clone(),
                payload_type: codec.payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        // Detached channels give us a plain read/write surface for the two
        // forwarding workers. Long ICE timeouts because there is no
        // persistent signaling channel to renegotiate over.
        let mut setting_engine = SettingEngine::default();
        setting_engine.detach_data_channels();
        setting_engine.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(registry)
            .build();

        // LAN-only: no STUN/TURN, the selected candidate pair stays local.
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: vec![],
                ..Default::default()
            })
            .await?,
        );

        let video_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            "video".to_string(),
            "pion".to_string(),
        ));
        pc.add_transceiver_from_track(
            Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        let ssrc = self.rtp.ssrc();
        let payload_type = codec.payload_type;
        let track = Arc::clone(&video_track);
        self.rtp
            .register(
                peer_id,
                Box::new(move |packet| {
                    let track = Arc::clone(&track);
                    Box::pin(async move {
                        let packet = rewrite_for_peer(packet, payload_type, ssrc);
                        track
                            .write_rtp(&packet)
                            .await
                            .context("could not write packet to video track")?;
                        Ok(())
                    })
                }),
            )
            .await;

        let manager_dc = Arc::clone(self);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let manager = Arc::clone(&manager_dc);
            Box::pin(async move {
                info!(peer_id, label = %dc.label(), id = dc.id(), "new data channel");
                let channel = Arc::clone(&dc);
                dc.on_open(Box::new(move || {
                    tokio::spawn(async move {
                        let raw = match channel.detach().await {
                            Ok(raw) => raw,
                            Err(e) => {
                                warn!(peer_id, "could not detach data channel: {e}");
                                return;
                            }
                        };
                        manager.run_data_channel(peer_id, raw).await;
                    });
                    Box::pin(async {})
                }));
            })
        }));

        let manager_ice = Arc::clone(self);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            info!(peer_id, %state, "ice connection state changed");
            let manager = Arc::clone(&manager_ice);
            Box::pin(async move {
                if state == RTCIceConnectionState::Closed {
                    manager.remove_peer(peer_id).await;
                }
            })
        }));

        match negotiate(&pc, offer).await {
            Ok(answer) => {
                let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
                peers.insert(peer_id, Arc::clone(&pc));
                info!(peer_id, "answer ready");
                Ok(answer)
            }
            Err(e) => {
                warn!(peer_id, "negotiation failed: {e}");
                self.remove_peer(peer_id).await;
                Err(e)
            }
        }
    }

    /// Wire both directions of an open, detached data channel, prime the
    /// send window, and keep announcing until the channel dies.
    async fn run_data_channel(self: &Arc<Self>, peer_id: u64, raw: Arc<DataChannel>) {
        // channel -> bus
        let manager = Arc::clone(self);
        let inbound = Arc::clone(&raw);
        tokio::spawn(async move {
            info!(peer_id, "starting datachannel->bus forwarding");
            inbound_loop(&inbound, &manager.events, peer_id).await;
            info!(peer_id, "ending datachannel->bus forwarding");
            // The read loop failing is the most reliable signal that the
            // peer is gone; drop its RTP and event subscriptions too.
            manager.remove_peer(peer_id).await;
        });

        // bus -> channel
        let outbound = Arc::clone(&raw);
        self.events
            .register(
                peer_id,
                Box::new(move |bytes| {
                    let channel = Arc::clone(&outbound);
                    Box::pin(async move {
                        channel
                            .write(&bytes)
                            .await
                            .context("could not write event to data channel")?;
                        Ok(())
                    })
                }),
            )
            .await;
        info!(peer_id, "starting bus->datachannel forwarding");

        for _ in 0..ANNOUNCE_PRIME_COUNT {
            if write_self_announcement(&raw).await.is_err() {
                break;
            }
        }

        let ticker_channel = Arc::clone(&raw);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ANNOUNCE_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = write_self_announcement(&ticker_channel).await {
                    info!(peer_id, "stopping announce ticker: {e}");
                    return;
                }
            }
        });
    }

    /// Tear down a peer: unregister from both fanouts and drop the
    /// connection object. Safe to call any number of times.
    async fn remove_peer(&self, peer_id: u64) {
        self.rtp.unregister(peer_id).await;
        self.events.unregister(peer_id).await;
        let removed = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            peers.remove(&peer_id)
        };
        if removed.is_some() {
            info!(peer_id, "peer removed");
        }
    }
}

/// Read fixed-size frames from the detached channel and put each decoded
/// event onto the bus. Returns when the channel reports EOF or an error.
async fn inbound_loop(channel: &DataChannel, events: &EventFanout, peer_id: u64) {
    let mut buffer = vec![0u8; MESSAGE_SIZE];
    loop {
        let n = match channel.read(&mut buffer).await {
            Ok(0) => {
                info!(peer_id, "data channel EOF");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                info!(peer_id, "data channel closed: {e}");
                return;
            }
        };
        let event = match Event::decode(&buffer[..n]) {
            Ok(event) => event,
            Err(e) => {
                warn!(peer_id, "invalid event on data channel: {e}");
                continue;
            }
        };
        events.send_event(&event).await;
    }
}

async fn write_self_announcement(channel: &DataChannel) -> anyhow::Result<()> {
    let bytes = self_announcement().encode_to_vec();
    channel
        .write(&bytes.into())
        .await
        .context("could not write announcement to data channel")?;
    Ok(())
}

/// The `ipc/announcement/webrtc-proxy` event peers use to detect us.
fn self_announcement() -> Event {
    let stamp = wire::now();
    let announce = Announce {
        service: PROXY_SERVICE.to_string(),
        stamp: Some(stamp.clone()),
        ..Default::default()
    };
    let mut event = Event::announcement(&announce);
    event.recv_stamp = Some(stamp);
    event
}

async fn negotiate(
    pc: &RTCPeerConnection,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription, PeerError> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;

    // Non-trickle: only one signaling round trip is available, so the
    // answer must already contain every gathered candidate.
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    pc.local_description()
        .await
        .ok_or(PeerError::NoLocalDescription)
}

fn rewrite_for_peer(mut packet: Packet, payload_type: u8, ssrc: u32) -> Packet {
    packet.header.payload_type = payload_type;
    packet.header.ssrc = ssrc;
    packet
}

/// Millisecond wall clock, forced strictly monotonic so peers created in
/// the same millisecond still get distinct ids.
fn next_peer_id() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64;
    let previous = LAST
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(previous + 1)
}

/// Scan the offer's video sections for an H264 rtpmap entry, capturing its
/// payload type and fmtp parameters when present.
fn h264_codec_from_sdp(sdp: &str) -> Option<NegotiatedCodec> {
    let mut in_video = false;
    let mut h264_payload_type: Option<u8> = None;
    let mut fmtp_lines: HashMap<u8, String> = HashMap::new();

    for line in sdp.lines() {
        let line = line.trim_end();
        if let Some(media) = line.strip_prefix("m=") {
            in_video = media.starts_with("video");
            continue;
        }
        if !in_video {
            continue;
        }
        if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            let mut parts = rtpmap.splitn(2, ' ');
            if let (Some(pt), Some(codec)) = (parts.next(), parts.next()) {
                let name = codec.split('/').next().unwrap_or("");
                if name.eq_ignore_ascii_case("H264") {
                    if let Ok(pt) = pt.parse::<u8>() {
                        h264_payload_type.get_or_insert(pt);
                    }
                }
            }
        } else if let Some(fmtp) = line.strip_prefix("a=fmtp:") {
            let mut parts = fmtp.splitn(2, ' ');
            if let (Some(pt), Some(params)) = (parts.next(), parts.next()) {
                if let Ok(pt) = pt.parse::<u8>() {
                    fmtp_lines.insert(pt, params.to_string());
                }
            }
        }
    }

    h264_payload_type.map(|payload_type| NegotiatedCodec {
        payload_type,
        fmtp: fmtp_lines.remove(&payload_type).unwrap_or_default(),
    })
}
