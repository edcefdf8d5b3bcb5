//! Twirp-style signaling surface.
//!
//! One POST route exchanges a base64-wrapped JSON SDP offer for an answer.
//! Decode problems are the caller's fault (`invalid_argument`); everything
//! that goes wrong past decoding is ours (`internal`). The router also
//! mounts the static web client and the blobstore when roots are configured.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::error;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use trestle_protocol::config::ProxyConfig;
use trestle_protocol::rpc::{
    InitiatePeerConnectionRequest, InitiatePeerConnectionResponse, TwirpError,
    INITIATE_PEER_CONNECTION_PATH,
};

use crate::peer::PeerManager;

#[derive(Debug, thiserror::Error)]
enum DecodeError {
    #[error("invalid base64")]
    InvalidBase64,
    #[error("invalid json")]
    InvalidJson,
}

/// Build the HTTP router: the signaling RPC (with permissive CORS, browsers
/// call it cross-origin), plus optional static and blobstore mounts.
pub fn build_router(manager: Arc<PeerManager>, config: &ProxyConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let mut router = Router::new()
        .route(INITIATE_PEER_CONNECTION_PATH, post(initiate_peer_connection))
        .layer(cors)
        .with_state(manager);

    if let Some(root) = &config.blobstore_root {
        router = router.nest_service("/blobs", ServeDir::new(root));
    }
    if let Some(root) = &config.static_root {
        router = router.fallback_service(ServeDir::new(root));
    }
    router
}

async fn initiate_peer_connection(
    State(manager): State<Arc<PeerManager>>,
    Json(request): Json<InitiatePeerConnectionRequest>,
) -> Response {
    let offer = match decode_session_description(&request.sdp) {
        Ok(offer) => offer,
        Err(e) => return twirp_error(TwirpError::invalid_argument(e.to_string())),
    };

    let answer = match manager.add_peer(offer).await {
        Ok(answer) => answer,
        Err(e) => {
            error!("could not add peer: {e}");
            return twirp_error(TwirpError::internal("could not initiate peer connection"));
        }
    };

    match encode_session_description(&answer) {
        Ok(sdp) => Json(InitiatePeerConnectionResponse { sdp }).into_response(),
        Err(e) => {
            error!("could not encode answer: {e}");
            twirp_error(TwirpError::internal("could not generate SDP"))
        }
    }
}

fn decode_session_description(wrapped: &str) -> Result<RTCSessionDescription, DecodeError> {
    let json = BASE64
        .decode(wrapped)
        .map_err(|_| DecodeError::InvalidBase64)?;
    serde_json::from_slice(&json).map_err(|_| DecodeError::InvalidJson)
}

fn encode_session_description(desc: &RTCSessionDescription) -> serde_json::Result<String> {
    Ok(BASE64.encode(serde_json::to_string(desc)?))
}

fn twirp_error(err: TwirpError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}
