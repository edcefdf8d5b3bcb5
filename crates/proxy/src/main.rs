mod events;
mod fanout;
mod peer;
mod rtp;
mod signaling;

use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use trestle_bus::{EventBus, EventBusConfig};
use trestle_protocol::config::ProxyConfig;

use crate::events::EventFanout;
use crate::peer::PeerManager;
use crate::rtp::{RtpFanout, RtpFanoutConfig};

/// Buffered handoff between the bus and the event fanout. The fanout drains
/// continuously; the buffer only absorbs dispatch jitter.
const EVENT_SINK_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration from the environment
    let config = ProxyConfig::from_env().context("invalid configuration")?;

    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    // Join the event bus; the sink feeds the per-peer event fanout
    let (event_tx, event_rx) = mpsc::channel(EVENT_SINK_CAPACITY);
    let bus = EventBus::bind(EventBusConfig {
        multicast_group: SocketAddrV4::new(config.event_bus_group, config.event_bus_port),
        service_name: config.service_name.clone(),
        event_sink: Some(event_tx),
        publish_announcements: true,
        subscriptions: config.bus_subscriptions.clone(),
    })
    .context("could not join the event bus")?;
    bus.start();

    // RTP ingest
    let rtp = RtpFanout::bind(RtpFanoutConfig {
        listen_addr: config.rtp_listen_addr,
        read_buffer_size: config.rtp_read_buffer_size,
        max_datagram_size: config.rtp_max_datagram_size,
    })
    .context("could not open the RTP listener")?;
    rtp.start();

    // Event fanout and the per-peer session manager
    let fanout = EventFanout::new(Arc::clone(&bus));
    fanout.start(event_rx);
    let manager = PeerManager::new(Arc::clone(&rtp), Arc::clone(&fanout));

    let app = signaling::build_router(manager, &config)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  Trestle WebRTC proxy v0.1.0");
    tracing::info!("  Signaling on http://{}", config.http_addr);
    tracing::info!("===========================================");

    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;

    tracing::info!("Server ready, accepting connections");

    // Runs until killed; there is no graceful shutdown path.
    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}
