use serde::{Deserialize, Serialize};

/// One telemetry tick as mirrored to dashboards inside a METRIC frame.
///
/// Throughput and loss figures are deltas over the tick interval; byte and
/// message counters are cumulative for the session. `link_state` and
/// `signaling_state` are opaque strings supplied by the transport side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub ts: f64,
    pub from: String,
    pub link_state: String,
    pub signaling_state: String,
    pub rtt_ms: Option<f64>,
    pub last_pong_at: Option<f64>,
    pub tx_kbps: f64,
    pub rx_kbps: f64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub msgs_sent: u64,
    pub msgs_recv: u64,
    pub loss_pct: f64,
    pub lost: u64,
    pub received: u64,
}
