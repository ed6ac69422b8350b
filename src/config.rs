use serde::Deserialize;
use std::net::SocketAddr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub peer: PeerSection,
    pub serial: SerialSection,
    pub relay: RelaySection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PeerSection {
    pub id: String,
    pub target: String,
    pub role: Role,
}

/// The initiator owns the forward direction (CONTROL lines) and offers the
/// channel; the responder owns the reverse direction (EVENT lines) and dials.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SerialSection {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelaySection {
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChannelSection {
    // Required for the initiator role, unused by the responder.
    pub listen: Option<SocketAddr>,
    pub advertise: Option<SocketAddr>,
    pub private_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySection {
    #[serde(default = "default_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub metric_interval_ms: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_interval_ms(),
            metric_interval_ms: default_interval_ms(),
        }
    }
}

fn default_baud() -> u32 {
    115_200
}

fn default_interval_ms() -> u64 {
    1000
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&content)?;
        Ok(cfg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [peer]
            id = "A"
            target = "B"
            role = "initiator"

            [serial]
            port = "/dev/ttyS0"

            [relay]
            addr = "127.0.0.1:8765"

            [channel]
            listen = "0.0.0.0:9400"
            advertise = "192.0.2.10:9400"
            private_key = "key.pem"
        "#;

        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.peer.id, "A");
        assert_eq!(cfg.peer.target, "B");
        assert_eq!(cfg.peer.role, Role::Initiator);
        assert_eq!(cfg.serial.port, "/dev/ttyS0");
        assert_eq!(cfg.serial.baud, 115_200);
        assert_eq!(cfg.relay.addr, "127.0.0.1:8765");
        assert_eq!(cfg.channel.listen.unwrap().port(), 9400);
        assert_eq!(cfg.channel.private_key.as_deref(), Some("key.pem"));
        assert_eq!(cfg.telemetry.ping_interval_ms, 1000);
        assert_eq!(cfg.telemetry.metric_interval_ms, 1000);
    }

    #[test]
    fn test_responder_needs_no_channel_section() {
        let toml_str = r#"
            [peer]
            id = "B"
            target = "A"
            role = "responder"

            [serial]
            port = "/dev/ttyUSB0"
            baud = 57600

            [relay]
            addr = "relay.example.net:8765"
        "#;

        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.peer.role, Role::Responder);
        assert_eq!(cfg.serial.baud, 57600);
        assert!(cfg.channel.listen.is_none());
    }
}
