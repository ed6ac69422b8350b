use crate::protocol::Envelope;
use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Identity token a dashboard sends as its first line.
pub const DASHBOARD_HELLO: &str = "DASHBOARD";

/// Frame kinds mirrored to every connected dashboard.
fn mirrors(kind: &str) -> bool {
    matches!(kind, "CONTROL" | "EVENT" | "METRIC")
}

type Tx = mpsc::UnboundedSender<String>;

struct PeerEntry {
    conn_id: u64,
    tx: Tx,
}

/// Connection registry: at most one handle per peer id (a new registration
/// replaces the old one), dashboards tracked by membership only.
#[derive(Default)]
pub struct Registry {
    peers: HashMap<String, PeerEntry>,
    dashboards: HashMap<u64, Tx>,
}

impl Registry {
    pub fn register_peer(&mut self, id: &str, conn_id: u64, tx: Tx) {
        if self
            .peers
            .insert(id.to_string(), PeerEntry { conn_id, tx })
            .is_some()
        {
            info!("peer {id} re-registered, replacing previous connection");
        }
    }

    pub fn register_dashboard(&mut self, conn_id: u64, tx: Tx) {
        self.dashboards.insert(conn_id, tx);
    }

    /// Removes the entry for a closed connection. A peer slot already taken
    /// over by a newer connection is left untouched.
    pub fn drop_conn(&mut self, peer_id: Option<&str>, conn_id: u64) {
        match peer_id {
            Some(id) => {
                if self.peers.get(id).is_some_and(|e| e.conn_id == conn_id) {
                    self.peers.remove(id);
                }
            }
            None => {
                self.dashboards.remove(&conn_id);
            }
        }
    }

    /// Routes one raw message: mirror telemetry/data kinds to every
    /// dashboard, forward addressed messages to the named peer. Both actions
    /// may fire for the same message; the raw text is forwarded verbatim.
    pub fn route(&mut self, raw: &str) {
        let Ok(env) = serde_json::from_str::<Envelope>(raw) else {
            debug!("ignoring unparseable relay message");
            return;
        };

        if env.kind.as_deref().is_some_and(mirrors) {
            // Fan out over a snapshot so failures can prune the set
            // mid-iteration.
            let targets: Vec<(u64, Tx)> = self
                .dashboards
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect();
            for (id, tx) in targets {
                if tx.send(raw.to_string()).is_err() {
                    warn!("dashboard {id} unreachable, dropping it");
                    self.dashboards.remove(&id);
                }
            }
        }

        if let Some(to) = env.to.as_deref() {
            match self.peers.get(to) {
                Some(entry) => {
                    let _ = entry.tx.send(raw.to_string());
                }
                None => debug!("no peer {to} registered, dropping addressed message"),
            }
        }
    }
}

pub async fn run(listen: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind relay listener on {listen}"))?;
    info!("relay listening on {listen}");
    serve(listener).await
}

pub async fn serve(listener: TcpListener) -> anyhow::Result<()> {
    let registry = Arc::new(Mutex::new(Registry::default()));
    let mut next_conn_id: u64 = 0;
    loop {
        let (stream, addr) = listener.accept().await?;
        next_conn_id += 1;
        let conn_id = next_conn_id;
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, addr, conn_id, registry).await {
                debug!("connection from {addr} ended: {e}");
            }
        });
    }
}

async fn handle_conn(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    registry: Arc<Mutex<Registry>>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(hello) = lines.next_line().await? else {
        return Ok(());
    };
    let hello = hello.trim().to_string();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    // Per-connection writer task: a slow receiver never blocks routing.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write_half
                .write_all(format!("{msg}\n").as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let peer_id = if hello == DASHBOARD_HELLO {
        registry.lock().await.register_dashboard(conn_id, tx);
        info!("dashboard connected from {addr}");
        None
    } else {
        registry.lock().await.register_peer(&hello, conn_id, tx);
        info!("peer {hello} connected from {addr}");
        Some(hello.clone())
    };

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => registry.lock().await.route(&line),
            Ok(None) => break,
            Err(e) => {
                debug!("read error from {addr}: {e}");
                break;
            }
        }
    }

    registry
        .lock()
        .await
        .drop_conn(peer_id.as_deref(), conn_id);
    info!("{} disconnected", peer_id.as_deref().unwrap_or("dashboard"));
    writer.abort();
    Ok(())
}
