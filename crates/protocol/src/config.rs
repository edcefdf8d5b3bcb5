use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Proxy configuration, loaded from the environment.
///
/// Every field has a default suitable for a single-host deployment; the
/// environment only needs to override what differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Multicast group address for the event bus (`EVENT_BUS_GROUP`).
    pub event_bus_group: Ipv4Addr,
    /// Multicast group port for the event bus (`EVENT_BUS_PORT`).
    pub event_bus_port: u16,
    /// Service name advertised in bus announcements (`SERVICE_NAME`).
    pub service_name: String,
    /// Subscription patterns advertised on the bus
    /// (`EVENT_BUS_SUBSCRIPTIONS`, comma-separated regexes).
    pub bus_subscriptions: Vec<String>,
    /// UDP address the RTP stream arrives on (`RTP_LISTEN_ADDR`).
    pub rtp_listen_addr: SocketAddr,
    /// OS receive buffer for the RTP socket (`RTP_READ_BUFFER_SIZE`).
    /// Too small and packet loss shows up in chrome://webrtc-internals.
    pub rtp_read_buffer_size: usize,
    /// Largest RTP datagram accepted (`RTP_MAX_DATAGRAM_SIZE`).
    pub rtp_max_datagram_size: usize,
    /// HTTP bind address for signaling and asset serving (`HTTP_ADDR`).
    pub http_addr: SocketAddr,
    /// Root directory for the web client, served at `/` (`STATIC_ROOT`).
    pub static_root: Option<PathBuf>,
    /// Root directory for blob files, served at `/blobs` (`BLOBSTORE_ROOT`).
    pub blobstore_root: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            event_bus_group: default_event_bus_group(),
            event_bus_port: default_event_bus_port(),
            service_name: default_service_name(),
            bus_subscriptions: default_bus_subscriptions(),
            rtp_listen_addr: default_rtp_listen_addr(),
            rtp_read_buffer_size: default_rtp_read_buffer_size(),
            rtp_max_datagram_size: default_rtp_max_datagram_size(),
            http_addr: default_http_addr(),
            static_root: None,
            blobstore_root: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = ProxyConfig::default();

        if let Some(v) = get("EVENT_BUS_GROUP") {
            config.event_bus_group = parse("EVENT_BUS_GROUP", &v, "IPv4 address")?;
        }
        if let Some(v) = get("EVENT_BUS_PORT") {
            config.event_bus_port = parse("EVENT_BUS_PORT", &v, "port number")?;
        }
        if let Some(v) = get("SERVICE_NAME") {
            config.service_name = v;
        }
        if let Some(v) = get("EVENT_BUS_SUBSCRIPTIONS") {
            config.bus_subscriptions = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = get("RTP_LISTEN_ADDR") {
            config.rtp_listen_addr = parse("RTP_LISTEN_ADDR", &v, "socket address")?;
        }
        if let Some(v) = get("RTP_READ_BUFFER_SIZE") {
            config.rtp_read_buffer_size = parse("RTP_READ_BUFFER_SIZE", &v, "byte count")?;
        }
        if let Some(v) = get("RTP_MAX_DATAGRAM_SIZE") {
            config.rtp_max_datagram_size = parse("RTP_MAX_DATAGRAM_SIZE", &v, "byte count")?;
        }
        if let Some(v) = get("HTTP_ADDR") {
            config.http_addr = parse("HTTP_ADDR", &v, "socket address")?;
        }
        if let Some(v) = get("STATIC_ROOT") {
            config.static_root = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BLOBSTORE_ROOT") {
            config.blobstore_root = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    /// Validate configuration semantics, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the proxy should not start)
    /// or "WARNING:" (advisory, the proxy can start but the config is likely
    /// wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if !self.event_bus_group.is_multicast() {
            issues.push(format!(
                "ERROR: EVENT_BUS_GROUP '{}' is not a multicast address \
                 (expected 224.0.0.0/4, e.g. 239.20.20.21).",
                self.event_bus_group
            ));
        }
        if self.event_bus_port == 0 {
            issues.push("ERROR: EVENT_BUS_PORT must be between 1 and 65535, got 0.".to_string());
        }
        if self.service_name.is_empty() {
            issues.push("ERROR: SERVICE_NAME must not be empty.".to_string());
        }
        if self.bus_subscriptions.is_empty() {
            issues.push(
                "WARNING: no EVENT_BUS_SUBSCRIPTIONS configured — peers will never \
                 unicast events to this proxy and browsers will see no bus traffic."
                    .to_string(),
            );
        }
        if self.rtp_max_datagram_size < 576 {
            issues.push(format!(
                "ERROR: RTP_MAX_DATAGRAM_SIZE must be at least 576 bytes, got {}.",
                self.rtp_max_datagram_size
            ));
        }
        if self.rtp_read_buffer_size < self.rtp_max_datagram_size {
            issues.push(format!(
                "WARNING: RTP_READ_BUFFER_SIZE ({}) is smaller than a single datagram \
                 ({}). Expect packet loss under any load.",
                self.rtp_read_buffer_size, self.rtp_max_datagram_size
            ));
        }
        if let Some(root) = &self.static_root {
            if !root.is_dir() {
                issues.push(format!(
                    "WARNING: STATIC_ROOT '{}' does not exist — the UI will not load.",
                    root.display()
                ));
            }
        }
        if let Some(root) = &self.blobstore_root {
            if !root.is_dir() {
                issues.push(format!(
                    "WARNING: BLOBSTORE_ROOT '{}' does not exist — /blobs will serve 404.",
                    root.display()
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn parse<T: std::str::FromStr>(
    key: &'static str,
    value: &str,
    expected: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: format!("expected {expected}"),
    })
}

fn default_event_bus_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 20, 20, 21)
}
fn default_event_bus_port() -> u16 {
    10000
}
fn default_service_name() -> String {
    "webrtc-proxy".to_string()
}
fn default_bus_subscriptions() -> Vec<String> {
    vec![".*".to_string()]
}
fn default_rtp_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(239, 20, 20, 20), 5000))
}
fn default_rtp_read_buffer_size() -> usize {
    1024 * 1024 * 8
}
fn default_rtp_max_datagram_size() -> usize {
    4096
}
fn default_http_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8585))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> Result<ProxyConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProxyConfig::from_vars(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = from_map(&[]).expect("empty environment should load defaults");
        assert_eq!(config.event_bus_group, Ipv4Addr::new(239, 20, 20, 21));
        assert_eq!(config.event_bus_port, 10000);
        assert_eq!(config.service_name, "webrtc-proxy");
        assert_eq!(config.bus_subscriptions, vec![".*"]);
        assert_eq!(
            config.rtp_listen_addr,
            "239.20.20.20:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.rtp_read_buffer_size, 8 * 1024 * 1024);
        assert_eq!(config.rtp_max_datagram_size, 4096);
        assert_eq!(
            config.http_addr,
            "0.0.0.0:8585".parse::<SocketAddr>().unwrap()
        );
        assert!(config.static_root.is_none());
        assert!(config.blobstore_root.is_none());
    }

    #[test]
    fn overrides_take_effect() {
        let config = from_map(&[
            ("EVENT_BUS_GROUP", "239.1.2.3"),
            ("EVENT_BUS_PORT", "11000"),
            ("SERVICE_NAME", "proxy-two"),
            ("EVENT_BUS_SUBSCRIPTIONS", "camera/.*, steering/.*"),
            ("RTP_LISTEN_ADDR", "239.20.20.30:5002"),
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("STATIC_ROOT", "/srv/www"),
            ("BLOBSTORE_ROOT", "/srv/blobs"),
        ])
        .expect("valid overrides should load");

        assert_eq!(config.event_bus_group, Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(config.event_bus_port, 11000);
        assert_eq!(config.service_name, "proxy-two");
        assert_eq!(config.bus_subscriptions, vec!["camera/.*", "steering/.*"]);
        assert_eq!(
            config.static_root.as_deref(),
            Some(std::path::Path::new("/srv/www"))
        );
        assert_eq!(
            config.blobstore_root.as_deref(),
            Some(std::path::Path::new("/srv/blobs"))
        );
    }

    #[test]
    fn bad_group_address_is_an_error() {
        let err = from_map(&[("EVENT_BUS_GROUP", "not-an-ip")]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("EVENT_BUS_GROUP"), "message names the key: {msg}");
        assert!(msg.contains("not-an-ip"));
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(from_map(&[("EVENT_BUS_PORT", "70000")]).is_err());
        assert!(from_map(&[("EVENT_BUS_PORT", "ten")]).is_err());
    }

    #[test]
    fn validate_default_config_passes() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok(), "default config should validate");
    }

    #[test]
    fn validate_unicast_group_is_error() {
        let mut config = ProxyConfig::default();
        config.event_bus_group = Ipv4Addr::new(10, 0, 0, 1);
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("multicast")));
    }

    #[test]
    fn validate_empty_subscriptions_is_warning() {
        let mut config = ProxyConfig::default();
        config.bus_subscriptions.clear();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING:")));
        assert!(!issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_tiny_datagram_limit_is_error() {
        let mut config = ProxyConfig::default();
        config.rtp_max_datagram_size = 100;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("RTP_MAX_DATAGRAM_SIZE")));
    }

    #[test]
    fn validate_missing_static_root_is_warning() {
        let mut config = ProxyConfig::default();
        config.static_root = Some(PathBuf::from("/definitely/not/a/real/dir"));
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("STATIC_ROOT")));
    }

    #[test]
    fn subscriptions_splitting_ignores_empty_segments() {
        let config = from_map(&[("EVENT_BUS_SUBSCRIPTIONS", "a,,b, ,c")]).unwrap();
        assert_eq!(config.bus_subscriptions, vec!["a", "b", "c"]);
    }
}
