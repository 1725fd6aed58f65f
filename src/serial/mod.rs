// src/serial/mod.rs - Serial link to the printer firmware
pub mod instruction;
pub mod mock;
pub mod port;
pub mod queue;
pub mod router;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use instruction::{
    FailureReason, Instruction, InstructionState, LineMatch, Priority, is_acknowledgement, is_busy_line,
};
pub use queue::{ExclusiveWrite, QueueError, QueueSignal, SerialQueue, Submission};
pub use router::OutputRouter;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial connection closed")]
    Closed,
}

/// Line-oriented byte link to the firmware.
///
/// Only the queue's scheduling loop, or whoever holds an [`ExclusiveWrite`]
/// grant, ever touches a transport.
#[async_trait]
pub trait Transport: Send {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Returns `Ok(None)` when `timeout` elapses without a complete line.
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;
}
