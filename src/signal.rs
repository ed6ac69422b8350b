use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Client side of a relay connection. The socket is split into a reader task
/// and a writer task; callers only touch the mpsc endpoints. The first line
/// on the wire is the identity token (a peer id, or the dashboard marker).
pub struct RelayClient {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl RelayClient {
    pub async fn connect(addr: &str, hello: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to relay {addr}"))?;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(format!("{hello}\n").as_bytes()).await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write_half
                    .write_all(format!("{msg}\n").as_bytes())
                    .await
                    .is_err()
                {
                    warn!("relay connection lost while writing");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if in_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("relay read failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    /// Fire-and-forget send; a dead relay connection must never stall the
    /// caller.
    pub fn send(&self, msg: String) {
        let _ = self.outbound.send(msg);
    }
}
