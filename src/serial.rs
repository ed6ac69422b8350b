use anyhow::Context;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Line-oriented handle on the local serial device. Complete inbound lines
/// arrive on `lines_in`; strings sent to `lines_out` are written to the
/// device with a trailing newline.
pub struct SerialLink {
    pub lines_in: mpsc::UnboundedReceiver<String>,
    pub lines_out: mpsc::UnboundedSender<String>,
}

/// Opens the device and spawns one blocking reader thread and one blocking
/// writer thread; the bridge only ever touches the mpsc endpoints.
pub fn open(path: &str, baud: u32) -> anyhow::Result<SerialLink> {
    let port = serialport::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(20))
        .open()
        .with_context(|| format!("open serial port {path}"))?;
    let writer = port.try_clone().context("clone serial port handle")?;

    info!("opened serial port {path} at {baud} baud");

    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || read_lines(port, in_tx));
    std::thread::spawn(move || {
        let mut writer = writer;
        while let Some(line) = out_rx.blocking_recv() {
            if let Err(e) = writer
                .write_all(line.as_bytes())
                .and_then(|()| writer.write_all(b"\n"))
            {
                error!("serial write failed: {e}");
                break;
            }
        }
    });

    Ok(SerialLink {
        lines_in: in_rx,
        lines_out: out_tx,
    })
}

fn read_lines(mut port: Box<dyn SerialPort>, tx: mpsc::UnboundedSender<String>) {
    let mut buf = [0u8; 512];
    let mut pending = String::new();
    loop {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                while let Some(pos) = pending.find('\n') {
                    let line = pending[..pos].trim().to_string();
                    pending.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(line).is_err() {
                        // bridge gone
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                error!("serial read failed: {e}");
                return;
            }
        }
    }
}
