// src/probes.rs - Printer identification queries issued at startup
use crate::serial::{FailureReason, Instruction, InstructionState, Priority, SerialQueue, Submission};
use crate::shutdown::ShutdownToken;
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;

pub const PRINTER_TYPE_PATTERN: &str = r"^(\d{3,5})$";
pub const FIRMWARE_PATTERN: &str = r"^FIRMWARE_NAME:Prusa-Firmware ?((\d+\.)*\d).*$";
pub const NOZZLE_PATTERN: &str = r"^(\d\.\d+)$";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Probe '{0}' ignored, serial is held exclusively")]
    WriteIgnored(String),
    #[error("Serial queue error: {0}")]
    Queue(#[from] crate::serial::QueueError),
    #[error("Probe '{command}' failed: {reason}")]
    Failed {
        command: String,
        reason: FailureReason,
    },
    #[error("Probe '{command}' ended {state:?}")]
    NoAnswer {
        command: String,
        state: InstructionState,
    },
    #[error("Printer responded with something unexpected: {0}")]
    Unexpected(String),
    #[error("Unsupported printer model '{0}'")]
    UnsupportedPrinter(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrinterType {
    #[serde(rename = "MK3")]
    Mk3,
    #[serde(rename = "MK3S")]
    Mk3s,
}

impl PrinterType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            300 | 20300 => Some(Self::Mk3),
            302 | 20302 => Some(Self::Mk3s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareInfo {
    pub version: String,
    /// Whether `version` meets the configured minimum.
    pub supported: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrinterInfo {
    pub printer_type: PrinterType,
    pub firmware: FirmwareInfo,
    pub nozzle_diameter: f64,
}

/// Compares dot-separated numeric versions; missing components count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Sends `command` ahead of normal traffic and returns its first capture group.
async fn query(
    queue: &SerialQueue,
    token: &ShutdownToken,
    command: &str,
    pattern: &str,
) -> Result<String, ProbeError> {
    let instruction = Instruction::new(command, Some(Regex::new(pattern)?), Priority::Front);
    if queue.enqueue(instruction.clone())?.is_write_ignored() {
        return Err(ProbeError::WriteIgnored(command.to_string()));
    }
    let state = instruction.wait_cancellable(token, None).await;
    match state {
        InstructionState::Confirmed => instruction
            .matched()
            .and_then(|found| found.group(1).map(str::to_string))
            .ok_or_else(|| ProbeError::Unexpected(command.to_string())),
        InstructionState::Failed => match instruction.failure() {
            Some(reason) => Err(ProbeError::Failed {
                command: command.to_string(),
                reason,
            }),
            None => Err(ProbeError::NoAnswer {
                command: command.to_string(),
                state,
            }),
        },
        state => Err(ProbeError::NoAnswer {
            command: command.to_string(),
            state,
        }),
    }
}

pub async fn printer_type(queue: &SerialQueue, token: &ShutdownToken) -> Result<PrinterType, ProbeError> {
    let raw = query(queue, token, "M862.2 Q", PRINTER_TYPE_PATTERN).await?;
    let code: u32 = raw.parse().map_err(|_| ProbeError::Unexpected(raw.clone()))?;
    match PrinterType::from_code(code) {
        Some(printer_type) => Ok(printer_type),
        None => {
            let notice = Instruction::new("M117 Unsupported printer", None, Priority::Front);
            if let Ok(Submission::WriteIgnored) = queue.enqueue(notice) {
                tracing::debug!("Unsupported printer notice ignored");
            }
            Err(ProbeError::UnsupportedPrinter(code))
        }
    }
}

pub async fn firmware_version(
    queue: &SerialQueue,
    token: &ShutdownToken,
    minimum: &str,
) -> Result<FirmwareInfo, ProbeError> {
    let version = query(queue, token, "M115", FIRMWARE_PATTERN).await?;
    let supported = compare_versions(&version, minimum) != Ordering::Less;
    if !supported {
        tracing::warn!("Firmware {} is older than the supported {}", version, minimum);
    }
    Ok(FirmwareInfo { version, supported })
}

pub async fn nozzle_diameter(queue: &SerialQueue, token: &ShutdownToken) -> Result<f64, ProbeError> {
    let raw = query(queue, token, "M862.1 Q", NOZZLE_PATTERN).await?;
    raw.parse().map_err(|_| ProbeError::Unexpected(raw))
}

/// Runs all identification probes in order.
pub async fn identify(
    queue: &SerialQueue,
    token: &ShutdownToken,
    minimum_firmware: &str,
) -> Result<PrinterInfo, ProbeError> {
    let printer_type = printer_type(queue, token).await?;
    let firmware = firmware_version(queue, token, minimum_firmware).await?;
    let nozzle_diameter = nozzle_diameter(queue, token).await?;
    tracing::info!(
        "Identified {:?} running firmware {} with a {} mm nozzle",
        printer_type,
        firmware.version,
        nozzle_diameter
    );
    Ok(PrinterInfo {
        printer_type,
        firmware,
        nozzle_diameter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("3.10.0", "3.10.0"), Ordering::Equal);
        assert_eq!(compare_versions("3.10", "3.10.0"), Ordering::Equal);
        assert_eq!(compare_versions("3.9.3", "3.10.0"), Ordering::Less);
        assert_eq!(compare_versions("3.10.1", "3.10.0"), Ordering::Greater);
        assert_eq!(compare_versions("4", "3.10.0"), Ordering::Greater);
    }

    #[test]
    fn test_printer_codes() {
        assert_eq!(PrinterType::from_code(300), Some(PrinterType::Mk3));
        assert_eq!(PrinterType::from_code(20302), Some(PrinterType::Mk3s));
        assert_eq!(PrinterType::from_code(250), None);
    }

    #[test]
    fn test_firmware_pattern() {
        let pattern = Regex::new(FIRMWARE_PATTERN).unwrap();
        let line = "FIRMWARE_NAME:Prusa-Firmware 3.10.1 based on Marlin FIRMWARE_URL:https://github.com/prusa3d/Prusa-Firmware";
        let captures = pattern.captures(line).unwrap();
        assert_eq!(&captures[1], "3.10.1");
    }
}
