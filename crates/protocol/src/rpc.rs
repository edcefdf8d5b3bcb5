//! Signaling RPC surface, Twirp-compatible.
//!
//! One operation: `InitiatePeerConnection`. The SDP travels as
//! `base64(json(SessionDescription))` in both directions so that browser
//! clients can treat it as an opaque token.

use serde::{Deserialize, Serialize};

/// Route for the single signaling operation.
pub const INITIATE_PEER_CONNECTION_PATH: &str =
    "/twirp/trestle.WebRtcProxyService/InitiatePeerConnection";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatePeerConnectionRequest {
    /// base64-wrapped JSON SDP offer.
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatePeerConnectionResponse {
    /// base64-wrapped JSON SDP answer.
    pub sdp: String,
}

/// Twirp error body. The `code` string doubles as the HTTP status selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwirpError {
    pub code: String,
    pub msg: String,
}

impl TwirpError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        TwirpError {
            code: "invalid_argument".to_string(),
            msg: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        TwirpError {
            code: "internal".to_string(),
            msg: msg.into(),
        }
    }

    /// HTTP status per the Twirp spec's code table.
    pub fn http_status(&self) -> u16 {
        match self.code.as_str() {
            "invalid_argument" => 400,
            "internal" => 500,
            _ => 500,
        }
    }
}
