use crate::state::MetricReport;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One application-level message exchanged over the peer channel or the relay
/// socket. The wire form is a single-line JSON object tagged by `type`;
/// `seq` is carried only by the CONTROL/EVENT variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "CONTROL")]
    Control(DataFrame),
    #[serde(rename = "EVENT")]
    Event(DataFrame),
    #[serde(rename = "PING")]
    Ping(Probe),
    #[serde(rename = "PONG")]
    Pong(Probe),
    #[serde(rename = "METRIC")]
    Metric(MetricReport),
}

/// Sequenced payload-bearing frame (a serial line in transit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub seq: u64,
    pub ts: f64,
    pub from: String,
    pub payload: String,
}

/// RTT probe. A PONG echoes the PING's `t0` unchanged; `ts` is the sender's
/// own clock at emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub t0: f64,
    pub ts: f64,
    pub from: String,
}

impl Frame {
    pub fn encode(&self) -> String {
        // Plain data types; serialization cannot fail.
        serde_json::to_string(self).expect("frame serialization")
    }

    pub fn decode(text: &str) -> Result<Frame, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Strictly increasing per-sender sequence counter, starting at 1. Single
/// owner per bridge, lives for the bridge lifetime.
#[derive(Debug, Default)]
pub struct Sequencer {
    last: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}

/// Routing view of a raw relay message. Decoded leniently: the relay never
/// rejects a message, it only inspects these two fields and forwards the raw
/// text verbatim.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

/// Addressed signaling message carried through the relay during channel
/// establishment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMsg {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: SignalData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    pub addr: String,
}

/// Wall-clock seconds since the Unix epoch, as carried in frame timestamps.
pub fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u64, payload: &str) -> DataFrame {
        DataFrame {
            seq,
            ts: 1714000000.25,
            from: "A".to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_round_trip_control_event() {
        for frame in [
            Frame::Control(data(1, "P,120,45")),
            Frame::Event(data(7, "BLOCK")),
        ] {
            let encoded = frame.encode();
            assert_eq!(Frame::decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn test_round_trip_probes() {
        let ping = Frame::Ping(Probe {
            t0: 1714000001.5,
            ts: 1714000001.5,
            from: "B".to_string(),
        });
        let pong = Frame::Pong(Probe {
            t0: 1714000001.5,
            ts: 1714000001.75,
            from: "A".to_string(),
        });
        assert_eq!(Frame::decode(&ping.encode()).unwrap(), ping);
        assert_eq!(Frame::decode(&pong.encode()).unwrap(), pong);
    }

    #[test]
    fn test_round_trip_metric() {
        let frame = Frame::Metric(MetricReport {
            ts: 1714000002.0,
            from: "A".to_string(),
            link_state: "connected:192.0.2.10:9400".to_string(),
            signaling_state: "established".to_string(),
            rtt_ms: Some(12.5),
            last_pong_at: Some(1714000001.75),
            tx_kbps: 8.0,
            rx_kbps: 0.5,
            bytes_sent: 1000,
            bytes_recv: 64,
            msgs_sent: 10,
            msgs_recv: 2,
            loss_pct: 25.0,
            lost: 1,
            received: 3,
        });
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(Frame::decode("").is_err());
        assert!(Frame::decode("not json at all").is_err());
        assert!(Frame::decode("[1,2,3]").is_err());
        // well-formed JSON, unrecognized kind
        assert!(Frame::decode(r#"{"type":"NOISE","from":"A"}"#).is_err());
        // CONTROL without its sequence number
        assert!(Frame::decode(r#"{"type":"CONTROL","ts":1.0,"from":"A","payload":"x"}"#).is_err());
    }

    #[test]
    fn test_sequencer_counts_from_one() {
        let mut seq = Sequencer::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.next(), 3);
    }

    #[test]
    fn test_signal_round_trip() {
        let offer = SignalMsg {
            from: "A".to_string(),
            to: "B".to_string(),
            kind: SignalKind::Offer,
            data: SignalData {
                addr: "192.0.2.10:9400".to_string(),
            },
        };
        let encoded = serde_json::to_string(&offer).unwrap();
        assert_eq!(serde_json::from_str::<SignalMsg>(&encoded).unwrap(), offer);
    }

    #[test]
    fn test_envelope_is_lenient() {
        let env: Envelope = serde_json::from_str(r#"{"to":"B","sdp":"..."}"#).unwrap();
        assert_eq!(env.to.as_deref(), Some("B"));
        assert!(env.kind.is_none());
    }
}
