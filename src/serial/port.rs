// src/serial/port.rs - Line transport over a real serial port
use super::{Transport, TransportError};
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Serial connection statistics
#[derive(Debug, Clone, Default)]
pub struct SerialStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub lines_sent: u64,
    pub lines_received: u64,
}

/// Serial transport speaking newline-terminated text
pub struct SerialTransport {
    port: SerialPort,
    port_name: String,
    /// Bytes read from the port that do not yet form a complete line
    buffer: Vec<u8>,
    stats: SerialStats,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        tracing::info!("Opening serial port {} at {} baud", port_name, baud_rate);
        let port = SerialPort::open(port_name, baud_rate)?;
        Ok(Self {
            port,
            port_name: port_name.to_string(),
            buffer: Vec::with_capacity(256),
            stats: SerialStats::default(),
        })
    }

    pub fn stats(&self) -> &SerialStats {
        &self.stats
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

/// Longest unterminated input kept while waiting for a newline.
const MAX_PARTIAL_LINE: usize = 4096;

/// Pops the next non-empty line out of `buffer`, if one is complete.
/// Trailing `\r` and surrounding whitespace are stripped. An unterminated
/// remainder longer than [`MAX_PARTIAL_LINE`] is discarded.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if !line.is_empty() {
            return Some(line.to_string());
        }
    }
    if buffer.len() > MAX_PARTIAL_LINE {
        tracing::warn!("Discarding {} bytes of serial input without a line break", buffer.len());
        buffer.clear();
    }
    None
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let data = format!("{}\n", line);
        tracing::debug!("Serial TX: {}", line);
        self.port.write_all(data.as_bytes()).await?;
        self.stats.bytes_sent += data.len() as u64;
        self.stats.lines_sent += 1;
        Ok(())
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, TransportError> {
        let deadline = Instant::now() + wait;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                self.stats.lines_received += 1;
                tracing::debug!("Serial RX: {}", line);
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // The chunk is only appended once the read completes, so dropping
            // this future mid-read never loses buffered bytes.
            match timeout(remaining, self.port.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    tracing::info!("Serial connection closed by remote");
                    return Err(TransportError::Closed);
                }
                Ok(Ok(n)) => {
                    self.stats.bytes_received += n as u64;
                    self.buffer.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Ok(Err(e)) => return Err(TransportError::Io(e)),
            }
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("stats", &self.stats)
            .finish()
    }
}
