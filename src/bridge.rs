use crate::config::{ChannelSection, Config, PeerSection, Role};
use crate::protocol::{
    now_unix, DataFrame, Frame, Probe, Sequencer, SignalData, SignalKind, SignalMsg,
};
use crate::signal::RelayClient;
use crate::stats::{Aggregator, Counters, LossTracker, RttTracker};
use crate::transport::{self, Channel, PeerChannel};
use anyhow::Context;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Interval};
use tracing::{debug, info, warn};

/// Outbound lines queued while the channel is still opening; oldest lines
/// are shed beyond this cap.
const PENDING_LINE_CAP: usize = 1024;

/// I/O endpoints the bridge multiplexes: the local serial device (as line
/// channels) and the relay connection.
pub struct BridgeIo {
    pub serial_rx: mpsc::UnboundedReceiver<String>,
    pub serial_tx: mpsc::UnboundedSender<String>,
    pub relay: RelayClient,
}

/// Per-endpoint protocol state machine. Owns every piece of mutable session
/// state (sequencer, loss tracker, RTT tracker, counters), so the whole
/// protocol runs in one task with no locking.
pub struct Bridge {
    id: String,
    target: String,
    role: Role,
    seq: Sequencer,
    loss: LossTracker,
    rtt: RttTracker,
    counters: Counters,
    aggregator: Aggregator,
    signaling_state: String,
    relay_open: bool,
}

/// Maps a raw serial line to outbound-worthiness for the given role: the
/// initiator forwards positional records (`P,...`) and `UNBLOCK`, the
/// responder forwards `BLOCK` and `UNBLOCK_ACK`.
pub fn accepts_line(role: Role, line: &str) -> bool {
    match role {
        Role::Initiator => line.starts_with("P,") || line == "UNBLOCK",
        Role::Responder => line == "BLOCK" || line == "UNBLOCK_ACK",
    }
}

/// Opens the serial device, registers with the relay, and runs the bridge
/// until the channel closes or the process is stopped.
pub async fn run_peer(config: Config) -> anyhow::Result<()> {
    let serial = crate::serial::open(&config.serial.port, config.serial.baud)?;
    let relay = RelayClient::connect(&config.relay.addr, &config.peer.id).await?;
    info!(
        "registered with relay {} as peer {}",
        config.relay.addr, config.peer.id
    );

    let io = BridgeIo {
        serial_rx: serial.lines_in,
        serial_tx: serial.lines_out,
        relay,
    };
    Bridge::new(&config.peer).run(io, &config).await
}

impl Bridge {
    pub fn new(peer: &PeerSection) -> Self {
        Self::with_identity(&peer.id, &peer.target, peer.role)
    }

    pub fn with_identity(id: &str, target: &str, role: Role) -> Self {
        Self {
            id: id.to_string(),
            target: target.to_string(),
            role,
            seq: Sequencer::new(),
            loss: LossTracker::default(),
            rtt: RttTracker::default(),
            counters: Counters::default(),
            aggregator: Aggregator::new(id),
            signaling_state: "registered".to_string(),
            relay_open: true,
        }
    }

    pub async fn run(mut self, mut io: BridgeIo, config: &Config) -> anyhow::Result<()> {
        let mut metric_timer = interval(Duration::from_millis(
            config.telemetry.metric_interval_ms.max(1),
        ));
        let mut pending: VecDeque<String> = VecDeque::new();

        let mut channel = match self.role {
            Role::Initiator => {
                self.establish_as_initiator(&mut io, &config.channel, &mut metric_timer, &mut pending)
                    .await?
            }
            Role::Responder => {
                self.establish_as_responder(&mut io, &mut metric_timer, &mut pending)
                    .await?
            }
        };
        info!(
            "channel open ({}), flushing {} queued line(s)",
            channel.status(),
            pending.len()
        );
        while let Some(line) = pending.pop_front() {
            self.send_line(&mut channel, &io, &line).await?;
        }

        let mut ping_timer = interval(Duration::from_millis(
            config.telemetry.ping_interval_ms.max(1),
        ));
        self.run_active(&mut channel, &mut io, &mut metric_timer, &mut ping_timer)
            .await
    }

    /// AWAITING_CHANNEL, initiator side: bind the listening endpoint, push
    /// the offer through the relay, then wait for the responder to connect
    /// while queueing serial lines and keeping metrics ticking.
    async fn establish_as_initiator(
        &mut self,
        io: &mut BridgeIo,
        cfg: &ChannelSection,
        metric_timer: &mut Interval,
        pending: &mut VecDeque<String>,
    ) -> anyhow::Result<PeerChannel> {
        let listen = cfg
            .listen
            .context("channel.listen is required for the initiator role")?;
        let advertise = cfg.advertise.unwrap_or(listen);
        let key_path = cfg
            .private_key
            .as_deref()
            .context("channel.private_key is required for the initiator role")?;
        let endpoint = transport::bind(listen, key_path)?;
        info!("channel endpoint listening on {listen}");

        let offer = SignalMsg {
            from: self.id.clone(),
            to: self.target.clone(),
            kind: SignalKind::Offer,
            data: SignalData {
                addr: advertise.to_string(),
            },
        };
        io.relay.send(serde_json::to_string(&offer)?);
        self.signaling_state = "offer-sent".to_string();

        let accept = transport::accept_channel(&endpoint);
        tokio::pin!(accept);
        loop {
            tokio::select! {
                res = &mut accept => {
                    let channel = res?;
                    self.signaling_state = "established".to_string();
                    return Ok(channel);
                }
                line = io.serial_rx.recv() => {
                    let Some(line) = line else {
                        anyhow::bail!("serial reader stopped");
                    };
                    self.queue_line(pending, line);
                }
                msg = io.relay.inbound.recv(), if self.relay_open => {
                    match msg {
                        Some(msg) => self.note_signal(&msg),
                        None => {
                            warn!("relay connection closed during signaling");
                            self.relay_open = false;
                        }
                    }
                }
                _ = metric_timer.tick() => self.emit_metric(io, "connecting"),
            }
        }
    }

    /// AWAITING_CHANNEL, responder side: wait for an offer addressed to us,
    /// dial the advertised endpoint, answer back through the relay.
    async fn establish_as_responder(
        &mut self,
        io: &mut BridgeIo,
        metric_timer: &mut Interval,
        pending: &mut VecDeque<String>,
    ) -> anyhow::Result<PeerChannel> {
        loop {
            tokio::select! {
                line = io.serial_rx.recv() => {
                    let Some(line) = line else {
                        anyhow::bail!("serial reader stopped");
                    };
                    self.queue_line(pending, line);
                }
                msg = io.relay.inbound.recv() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("relay connection closed before an offer arrived");
                    };
                    let Ok(sig) = serde_json::from_str::<SignalMsg>(&msg) else {
                        debug!("ignoring relay message during signaling");
                        continue;
                    };
                    if sig.kind != SignalKind::Offer || sig.to != self.id {
                        continue;
                    }
                    let addr: SocketAddr = sig
                        .data
                        .addr
                        .parse()
                        .context("offer carries an unparseable address")?;
                    info!("offer from {}, dialing {addr}", sig.from);
                    let channel = transport::connect(addr).await?;

                    let answer = SignalMsg {
                        from: self.id.clone(),
                        to: self.target.clone(),
                        kind: SignalKind::Answer,
                        data: SignalData {
                            addr: addr.to_string(),
                        },
                    };
                    io.relay.send(serde_json::to_string(&answer)?);
                    self.signaling_state = "established".to_string();
                    return Ok(channel);
                }
                _ = metric_timer.tick() => self.emit_metric(io, "connecting"),
            }
        }
    }

    /// ACTIVE: multiplexes the serial source, the peer channel, the ping
    /// timer, and the metrics timer until the channel closes.
    pub(crate) async fn run_active<C: Channel>(
        &mut self,
        channel: &mut C,
        io: &mut BridgeIo,
        metric_timer: &mut Interval,
        ping_timer: &mut Interval,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                line = io.serial_rx.recv() => {
                    let Some(line) = line else {
                        anyhow::bail!("serial reader stopped");
                    };
                    if accepts_line(self.role, &line) {
                        self.send_line(channel, io, &line).await?;
                    } else {
                        debug!("ignoring serial line {line:?}");
                    }
                }
                msg = channel.recv_text() => {
                    let Some(msg) = msg else {
                        info!("peer channel closed");
                        return Ok(());
                    };
                    self.handle_channel_msg(channel, io, &msg).await?;
                }
                _ = ping_timer.tick() => {
                    let now = now_unix();
                    let ping = Frame::Ping(Probe {
                        t0: now,
                        ts: now,
                        from: self.id.clone(),
                    });
                    self.send_frame(channel, &ping).await?;
                }
                _ = metric_timer.tick() => {
                    let status = channel.status();
                    self.emit_metric(io, &status);
                }
                msg = io.relay.inbound.recv(), if self.relay_open => {
                    match msg {
                        Some(msg) => debug!("ignoring relay message {msg:?}"),
                        None => {
                            warn!("relay connection closed, telemetry mirroring stops");
                            self.relay_open = false;
                        }
                    }
                }
            }
        }
    }

    async fn handle_channel_msg<C: Channel>(
        &mut self,
        channel: &mut C,
        io: &BridgeIo,
        raw: &str,
    ) -> anyhow::Result<()> {
        self.counters.note_recv(raw.len());

        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("discarding undecodable channel message: {e}");
                return Ok(());
            }
        };

        match frame {
            Frame::Ping(probe) => {
                let pong = Frame::Pong(Probe {
                    t0: probe.t0,
                    ts: now_unix(),
                    from: self.id.clone(),
                });
                self.send_frame(channel, &pong).await?;
            }
            Frame::Pong(probe) => {
                self.rtt.observe_pong(probe.t0, now_unix());
            }
            Frame::Control(data) | Frame::Event(data) => {
                self.loss.observe(data.seq);
                if io.serial_tx.send(data.payload).is_err() {
                    warn!("serial writer gone, dropping inbound payload");
                }
            }
            Frame::Metric(_) => {
                debug!("ignoring METRIC frame on the peer channel");
            }
        }
        Ok(())
    }

    /// Wraps an outbound-worthy serial line, sends it on the channel, and
    /// mirrors the encoded frame to the relay for the dashboards.
    async fn send_line<C: Channel>(
        &mut self,
        channel: &mut C,
        io: &BridgeIo,
        line: &str,
    ) -> anyhow::Result<()> {
        let data = DataFrame {
            seq: self.seq.next(),
            ts: now_unix(),
            from: self.id.clone(),
            payload: line.to_string(),
        };
        let frame = match self.role {
            Role::Initiator => Frame::Control(data),
            Role::Responder => Frame::Event(data),
        };
        let raw = frame.encode();
        channel.send_text(&raw).await?;
        self.counters.note_sent(raw.len());
        io.relay.send(raw);
        Ok(())
    }

    async fn send_frame<C: Channel>(
        &mut self,
        channel: &mut C,
        frame: &Frame,
    ) -> anyhow::Result<()> {
        let raw = frame.encode();
        channel.send_text(&raw).await?;
        self.counters.note_sent(raw.len());
        Ok(())
    }

    fn queue_line(&mut self, pending: &mut VecDeque<String>, line: String) {
        if !accepts_line(self.role, &line) {
            return;
        }
        if pending.len() == PENDING_LINE_CAP {
            warn!("pending line queue full, shedding the oldest line");
            pending.pop_front();
        }
        pending.push_back(line);
    }

    fn emit_metric(&mut self, io: &BridgeIo, link_state: &str) {
        let report = self.aggregator.tick(
            &self.counters,
            &self.rtt,
            &self.loss,
            link_state,
            &self.signaling_state,
        );
        io.relay.send(Frame::Metric(report).encode());
    }

    fn note_signal(&mut self, raw: &str) {
        match serde_json::from_str::<SignalMsg>(raw) {
            Ok(sig) if sig.kind == SignalKind::Answer && sig.to == self.id => {
                info!("answer received from {}", sig.from);
                self.signaling_state = "answered".to_string();
            }
            _ => debug!("ignoring relay message during signaling"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock_pair;

    #[test]
    fn test_line_grammar_per_role() {
        assert!(accepts_line(Role::Initiator, "P,120,45"));
        assert!(accepts_line(Role::Initiator, "UNBLOCK"));
        assert!(!accepts_line(Role::Initiator, "BLOCK"));
        assert!(!accepts_line(Role::Initiator, "UNBLOCK_ACK"));
        assert!(!accepts_line(Role::Initiator, "noise"));

        assert!(accepts_line(Role::Responder, "BLOCK"));
        assert!(accepts_line(Role::Responder, "UNBLOCK_ACK"));
        assert!(!accepts_line(Role::Responder, "P,120,45"));
        assert!(!accepts_line(Role::Responder, "UNBLOCK"));
        assert!(!accepts_line(Role::Responder, ""));
    }

    #[test]
    fn test_queue_sheds_oldest_beyond_cap() {
        let mut bridge = Bridge::with_identity("A", "B", Role::Initiator);
        let mut pending = VecDeque::new();
        for i in 0..(PENDING_LINE_CAP + 10) {
            bridge.queue_line(&mut pending, format!("P,{i}"));
        }
        assert_eq!(pending.len(), PENDING_LINE_CAP);
        assert_eq!(pending.front().unwrap(), "P,10");
        // non-matching lines are never queued
        bridge.queue_line(&mut pending, "garbage".to_string());
        assert_eq!(pending.len(), PENDING_LINE_CAP);
    }

    #[tokio::test]
    async fn test_active_bridge_frame_flow() {
        let (local, mut remote) = mock_pair();
        let (serial_in_tx, serial_in_rx) = mpsc::unbounded_channel();
        let (serial_out_tx, mut serial_out_rx) = mpsc::unbounded_channel();
        let (relay_out_tx, mut relay_out_rx) = mpsc::unbounded_channel();
        let (_relay_in_tx, relay_in_rx) = mpsc::unbounded_channel::<String>();

        let io = BridgeIo {
            serial_rx: serial_in_rx,
            serial_tx: serial_out_tx,
            relay: RelayClient {
                outbound: relay_out_tx,
                inbound: relay_in_rx,
            },
        };

        let worker = tokio::spawn(async move {
            let mut bridge = Bridge::with_identity("A", "B", Role::Initiator);
            let mut io = io;
            let mut channel = local;
            let mut metric_timer = interval(Duration::from_secs(3600));
            let mut ping_timer = interval(Duration::from_secs(3600));
            // consume the immediate first tick of both timers
            metric_timer.tick().await;
            ping_timer.tick().await;
            bridge
                .run_active(&mut channel, &mut io, &mut metric_timer, &mut ping_timer)
                .await
        });

        // a matching line becomes CONTROL seq 1 and is mirrored to the relay
        serial_in_tx.send("P,10,20".to_string()).unwrap();
        serial_in_tx.send("garbage".to_string()).unwrap();
        let raw = remote.rx.recv().await.unwrap();
        match Frame::decode(&raw).unwrap() {
            Frame::Control(data) => {
                assert_eq!(data.seq, 1);
                assert_eq!(data.from, "A");
                assert_eq!(data.payload, "P,10,20");
            }
            other => panic!("expected CONTROL, got {other:?}"),
        }
        assert_eq!(relay_out_rx.recv().await.unwrap(), raw);

        // inbound EVENT lands on the serial sink
        let event = Frame::Event(DataFrame {
            seq: 1,
            ts: 1.0,
            from: "B".to_string(),
            payload: "BLOCK".to_string(),
        });
        remote.tx.send(event.encode()).unwrap();
        assert_eq!(serial_out_rx.recv().await.unwrap(), "BLOCK");

        // a PING is answered with a PONG echoing t0
        remote
            .tx
            .send(
                Frame::Ping(Probe {
                    t0: 123.0,
                    ts: 123.0,
                    from: "B".to_string(),
                })
                .encode(),
            )
            .unwrap();
        let raw = remote.rx.recv().await.unwrap();
        match Frame::decode(&raw).unwrap() {
            Frame::Pong(probe) => {
                assert_eq!(probe.t0, 123.0);
                assert_eq!(probe.from, "A");
            }
            other => panic!("expected PONG, got {other:?}"),
        }

        // an undecodable channel message is discarded, not fatal
        remote.tx.send("not a frame".to_string()).unwrap();

        // closing the remote side ends the bridge cleanly
        drop(remote);
        worker.await.unwrap().unwrap();
    }
}
