//! Contains the data models for API requests and responses.

use crate::probes::PrinterInfo;
use crate::serial::InstructionState;
use crate::state::{PrinterState, StateSnapshot};
use serde::{Deserialize, Serialize};

/// Response for `GET /api/v1/status`.
#[derive(Serialize, Debug)]
pub struct PrinterStatusResponse {
    pub state: PrinterState,
    pub details: StateSnapshot,
    /// Identification results, once the startup probes have run.
    pub printer: Option<PrinterInfo>,
    pub pending_instructions: usize,
    pub exclusive_write: bool,
}

/// Represents a request to execute a G-code command.
#[derive(Deserialize, Debug)]
pub struct GcodeCommandRequest {
    pub command: String,
    /// Optional pattern the confirming reply must match.
    #[serde(default)]
    pub expect: Option<String>,
    /// Send ahead of queued normal traffic.
    #[serde(default)]
    pub front: bool,
}

#[derive(Serialize, Debug)]
pub struct GcodeCommandResponse {
    pub id: Option<u64>,
    pub state: InstructionState,
    pub output: Vec<String>,
    pub groups: Vec<Option<String>>,
}

#[derive(Deserialize, Debug)]
pub struct OverrideRequest {
    pub state: PrinterState,
}

#[derive(Deserialize, Debug)]
pub struct PrintRequest {
    /// Path of a G-code file on the host.
    pub path: String,
}
