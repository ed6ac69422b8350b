use crate::protocol::now_unix;
use crate::state::MetricReport;
use std::time::Instant;

/// Gap-based loss accounting for one inbound sequence stream.
///
/// Only forward gaps count as loss; duplicates and reordered arrivals are
/// accepted without penalty.
#[derive(Debug, Default)]
pub struct LossTracker {
    expected: Option<u64>,
    lost: u64,
    received: u64,
}

impl LossTracker {
    pub fn observe(&mut self, seq: u64) {
        self.received += 1;
        if let Some(expected) = self.expected {
            if seq > expected + 1 {
                self.lost += seq - expected - 1;
            }
        }
        self.expected = Some(seq);
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn loss_pct(&self) -> f64 {
        let denom = self.lost + self.received;
        if denom == 0 {
            0.0
        } else {
            self.lost as f64 / denom as f64 * 100.0
        }
    }
}

/// Latest round-trip estimate from the PING/PONG exchange. A PONG that never
/// arrives leaves `rtt_ms` stale; staleness shows through `last_pong_at`.
#[derive(Debug, Default)]
pub struct RttTracker {
    rtt_ms: Option<f64>,
    last_pong_at: Option<f64>,
}

impl RttTracker {
    pub fn observe_pong(&mut self, t0: f64, now: f64) {
        self.rtt_ms = Some((now - t0) * 1000.0);
        self.last_pong_at = Some(now);
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt_ms
    }

    pub fn last_pong_at(&self) -> Option<f64> {
        self.last_pong_at
    }
}

/// Cumulative channel traffic counters, monotonically non-decreasing for the
/// session lifetime. Counts peer-channel traffic only, not the relay mirror.
#[derive(Debug, Default)]
pub struct Counters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub msgs_sent: u64,
    pub msgs_recv: u64,
}

impl Counters {
    pub fn note_sent(&mut self, bytes: usize) {
        self.msgs_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn note_recv(&mut self, bytes: usize) {
        self.msgs_recv += 1;
        self.bytes_recv += bytes as u64;
    }
}

/// Periodic metrics synthesis: throughput from the counter delta since the
/// previous tick, loss percentage from the tracker, everything else copied
/// through. Snapshots are never retroactively corrected.
pub struct Aggregator {
    peer_id: String,
    prev_bytes_sent: u64,
    prev_bytes_recv: u64,
    last_tick: Instant,
}

impl Aggregator {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            prev_bytes_sent: 0,
            prev_bytes_recv: 0,
            last_tick: Instant::now(),
        }
    }

    pub fn tick(
        &mut self,
        counters: &Counters,
        rtt: &RttTracker,
        loss: &LossTracker,
        link_state: &str,
        signaling_state: &str,
    ) -> MetricReport {
        let elapsed = self.last_tick.elapsed().as_secs_f64();
        self.last_tick = Instant::now();
        let report = self.report_for(elapsed, counters, rtt, loss, link_state, signaling_state);
        self.prev_bytes_sent = counters.bytes_sent;
        self.prev_bytes_recv = counters.bytes_recv;
        report
    }

    fn report_for(
        &self,
        elapsed_secs: f64,
        counters: &Counters,
        rtt: &RttTracker,
        loss: &LossTracker,
        link_state: &str,
        signaling_state: &str,
    ) -> MetricReport {
        let dt = elapsed_secs.max(1e-6);
        let tx_kbps = (counters.bytes_sent - self.prev_bytes_sent) as f64 * 8.0 / dt / 1000.0;
        let rx_kbps = (counters.bytes_recv - self.prev_bytes_recv) as f64 * 8.0 / dt / 1000.0;

        MetricReport {
            ts: now_unix(),
            from: self.peer_id.clone(),
            link_state: link_state.to_string(),
            signaling_state: signaling_state.to_string(),
            rtt_ms: rtt.rtt_ms(),
            last_pong_at: rtt.last_pong_at(),
            tx_kbps,
            rx_kbps,
            bytes_sent: counters.bytes_sent,
            bytes_recv: counters.bytes_recv,
            msgs_sent: counters.msgs_sent,
            msgs_recv: counters.msgs_recv,
            loss_pct: loss.loss_pct(),
            lost: loss.lost(),
            received: loss.received(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(seqs: &[u64]) -> LossTracker {
        let mut tracker = LossTracker::default();
        for &s in seqs {
            tracker.observe(s);
        }
        tracker
    }

    #[test]
    fn test_contiguous_stream_has_no_loss() {
        assert_eq!(feed(&[1, 2, 3]).lost(), 0);
    }

    #[test]
    fn test_forward_gap_counts_skipped_values() {
        assert_eq!(feed(&[1, 3, 4]).lost(), 1);
        assert_eq!(feed(&[1, 10]).lost(), 8);
    }

    #[test]
    fn test_first_observation_charges_nothing() {
        let tracker = feed(&[5]);
        assert_eq!(tracker.lost(), 0);
        assert_eq!(tracker.received(), 1);
    }

    #[test]
    fn test_reorders_and_duplicates_are_not_loss() {
        let tracker = feed(&[1, 2, 2, 4, 3]);
        // 2->4 skipped one value; the backward step afterwards adds nothing
        assert_eq!(tracker.lost(), 1);
        assert_eq!(tracker.received(), 5);
    }

    #[test]
    fn test_loss_pct() {
        let tracker = feed(&[1, 3, 4]);
        assert!((tracker.loss_pct() - 25.0).abs() < 1e-9);
        assert_eq!(LossTracker::default().loss_pct(), 0.0);
    }

    #[test]
    fn test_rtt_from_pong() {
        let mut rtt = RttTracker::default();
        rtt.observe_pong(1714000000.0, 1714000000.25);
        assert!((rtt.rtt_ms().unwrap() - 250.0).abs() < 1e-6);
        assert_eq!(rtt.last_pong_at(), Some(1714000000.25));
    }

    #[test]
    fn test_throughput_from_counter_delta() {
        let agg = Aggregator::new("A");
        let mut counters = Counters::default();
        counters.bytes_sent = 1000;
        counters.bytes_recv = 500;
        let report = agg.report_for(
            1.0,
            &counters,
            &RttTracker::default(),
            &LossTracker::default(),
            "connected",
            "established",
        );
        assert!((report.tx_kbps - 8.0).abs() < 1e-9);
        assert!((report.rx_kbps - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_tick_resets_the_baseline() {
        let mut agg = Aggregator::new("A");
        let mut counters = Counters::default();
        counters.note_sent(1000);
        let first = agg.tick(
            &counters,
            &RttTracker::default(),
            &LossTracker::default(),
            "connected",
            "established",
        );
        assert_eq!(first.bytes_sent, 1000);
        // no new traffic since the previous tick
        let second = agg.tick(
            &counters,
            &RttTracker::default(),
            &LossTracker::default(),
            "connected",
            "established",
        );
        assert_eq!(second.tx_kbps, 0.0);
        assert_eq!(second.bytes_sent, 1000);
    }
}
