//! In-memory transport used by the test suite and by `--simulate` mode.
//!
//! [`mock_pair`] returns the transport half (handed to the queue) and a
//! [`MockFirmware`] half that plays the printer: it sees every written line
//! and injects lines, read errors, write failures or a closed link.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Debug)]
enum MockEvent {
    Line(String),
    Error(std::io::ErrorKind),
}

pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<MockEvent>,
    written: mpsc::UnboundedSender<String>,
    failing_writes: Arc<AtomicU32>,
}

pub struct MockFirmware {
    incoming: mpsc::UnboundedSender<MockEvent>,
    written: mpsc::UnboundedReceiver<String>,
    failing_writes: Arc<AtomicU32>,
}

pub fn mock_pair() -> (MockTransport, MockFirmware) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let failing_writes = Arc::new(AtomicU32::new(0));
    (
        MockTransport {
            incoming: incoming_rx,
            written: written_tx,
            failing_writes: failing_writes.clone(),
        },
        MockFirmware {
            incoming: incoming_tx,
            written: written_rx,
            failing_writes,
        },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        self.written
            .send(line.to_string())
            .map_err(|_| TransportError::Closed)
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, TransportError> {
        match timeout(wait, self.incoming.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(MockEvent::Line(line))) => Ok(Some(line)),
            Ok(Some(MockEvent::Error(kind))) => Err(TransportError::Io(kind.into())),
            Ok(None) => Err(TransportError::Closed),
        }
    }
}

impl MockFirmware {
    /// Queue a line for the host to read.
    pub fn send_line(&self, line: impl Into<String>) {
        let _ = self.incoming.send(MockEvent::Line(line.into()));
    }

    /// Make the next host read fail with an I/O error of `kind`.
    pub fn send_error(&self, kind: std::io::ErrorKind) {
        let _ = self.incoming.send(MockEvent::Error(kind));
    }

    /// Make the next `count` host writes fail.
    pub fn fail_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Next line the host wrote, or `None` if nothing arrives within `wait`.
    pub async fn next_written(&mut self, wait: Duration) -> Option<String> {
        timeout(wait, self.written.recv()).await.ok().flatten()
    }

    pub fn try_written(&mut self) -> Option<String> {
        self.written.try_recv().ok()
    }
}

/// Canned replies for the commands the daemon issues on its own, modelled on
/// an MK3S running 3.10 firmware.
fn simulated_reply(command: &str) -> Vec<String> {
    let lines: &[&str] = match command.trim() {
        "M105" => &["ok T:215.0 /215.0 B:60.0 /60.0 T0:215.0 /215.0 @:42 B@:17 P:0.0 A:30.2"],
        "M114" => &[
            "X:10.00 Y:20.00 Z:0.30 E:0.00 Count X:10.00 Y:20.00 Z:0.30 E:0.00",
            "ok",
        ],
        "PRUSA FAN" => &["E0:3600 RPM", "PRN0:4800 RPM", "ok"],
        "M27" => &["Not SD printing", "ok"],
        "M73" => &[
            "NORMAL MODE: Percent done: 0; print time remaining in mins: 0; Change in mins: -1",
            "SILENT MODE: Percent done: 0; print time remaining in mins: 0",
            "ok",
        ],
        "M115" => &[
            "FIRMWARE_NAME:Prusa-Firmware 3.10.0 based on Marlin FIRMWARE_URL:https://github.com/prusa3d/Prusa-Firmware PROTOCOL_VERSION:1.0 MACHINE_TYPE:Prusa i3 MK3S EXTRUDER_COUNT:1",
            "ok",
        ],
        "M862.2 Q" => &["302", "ok"],
        "M862.1 Q" => &["0.40", "ok"],
        _ => &["ok"],
    };
    lines.iter().map(|line| line.to_string()).collect()
}

/// Drives `firmware` as a well-behaved printer until the host side goes away.
pub fn spawn_simulator(mut firmware: MockFirmware) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Simulated printer started");
        while let Some(command) = firmware.written.recv().await {
            tracing::trace!("Simulator received: {}", command);
            for line in simulated_reply(&command) {
                firmware.send_line(line);
            }
        }
        tracing::info!("Simulated printer stopped");
    })
}
