//! Field extraction from Prusa firmware status replies.
//!
//! Each [`FieldParser`] pairs a pattern with the snapshot fields it fills.
//! The same parsers fold matched replies of telemetry queries and
//! unsolicited lines (heating autoreports, second lines of multi-line
//! replies) routed through the output router.

use super::{Telemetry, TelemetryStore};
use crate::serial::{LineMatch, OutputRouter};
use regex::Regex;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const TEMPERATURE_PATTERN: &str = concat!(
    r"^ok ?T: ?(-?\d+\.\d+) ?/(-?\d+\.\d+) ?B: ?(-?\d+\.\d+) ?/(-?\d+\.\d+) ?",
    r"T0: ?(-?\d+\.\d+) ?/(-?\d+\.\d+) ?@: ?(-?\d+) ?B@: ?(-?\d+) ?P: ?(-?\d+\.\d+) ?",
    r"A: ?(-?\d+\.\d+)$"
);
pub const POSITION_PATTERN: &str = concat!(
    r"^X: ?(-?\d+\.\d+) ?Y: ?(-?\d+\.\d+) ?Z: ?(-?\d+\.\d+) ?E: ?(-?\d+\.\d+) ?",
    r"Count ?X: ?(-?\d+\.\d+) ?Y: ?(-?\d+\.\d+) ?Z: ?(-?\d+\.\d+) ?E: ?(-?\d+\.\d+)$"
);
pub const E_FAN_PATTERN: &str = r"^E0:(\d+) ?RPM$";
pub const P_FAN_PATTERN: &str = r"^PRN0:(\d+) ?RPM$";
pub const PRINT_TIME_PATTERN: &str = r"^(Not SD printing)$|^((\d+):(\d{2}))$";
pub const PROGRESS_PATTERN: &str = r"^NORMAL MODE: Percent done: (\d+);.*";
pub const TIME_REMAINING_PATTERN: &str =
    r"^SILENT MODE: Percent done: (\d+); print time remaining in mins: (-?\d+) ?$";
pub const HEATING_PATTERN: &str = r"^T:(\d+\.\d+) E:\d+ B:(\d+\.\d+)$";
pub const HEATING_HOTEND_PATTERN: &str = r"^T:(\d+\.\d+) E:([?]|\d+) W:([?]|\d+)$";

/// Status queries issued every cycle, in order, with the pattern of the
/// reply line that confirms each one.
pub const TELEMETRY_QUERIES: [(&str, &str); 5] = [
    ("M105", TEMPERATURE_PATTERN),
    ("M114", POSITION_PATTERN),
    ("PRUSA FAN", E_FAN_PATTERN),
    ("M27", PRINT_TIME_PATTERN),
    ("M73", PROGRESS_PATTERN),
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Missing capture group {0}")]
    MissingGroup(usize),
    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

type Apply = fn(&LineMatch, &mut Telemetry) -> Result<(), ParseError>;

pub struct FieldParser {
    name: &'static str,
    pattern: Regex,
    apply: Apply,
}

impl FieldParser {
    fn new(name: &'static str, pattern: &str, apply: Apply) -> Result<Self, ParseError> {
        Ok(Self {
            name,
            pattern: Regex::new(pattern)?,
            apply,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn apply(&self, found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
        (self.apply)(found, telemetry)
    }
}

impl std::fmt::Debug for FieldParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldParser")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

pub fn field_parsers() -> Result<Vec<FieldParser>, ParseError> {
    Ok(vec![
        FieldParser::new("temperature", TEMPERATURE_PATTERN, temperature)?,
        FieldParser::new("position", POSITION_PATTERN, position)?,
        FieldParser::new("e_fan", E_FAN_PATTERN, e_fan)?,
        FieldParser::new("p_fan", P_FAN_PATTERN, p_fan)?,
        FieldParser::new("print_time", PRINT_TIME_PATTERN, print_time)?,
        FieldParser::new("progress", PROGRESS_PATTERN, progress)?,
        FieldParser::new("time_remaining", TIME_REMAINING_PATTERN, time_remaining)?,
        FieldParser::new("heating", HEATING_PATTERN, heating)?,
        FieldParser::new("heating_hotend", HEATING_HOTEND_PATTERN, heating_hotend)?,
    ])
}

/// Runs every parser matching `line` against `telemetry`. Returns how many matched.
pub fn fold_line(parsers: &[FieldParser], line: &str, telemetry: &mut Telemetry) -> usize {
    let mut matched = 0;
    for parser in parsers {
        let Some(found) = LineMatch::find(&parser.pattern, line) else {
            continue;
        };
        matched += 1;
        if let Err(e) = parser.apply(&found, telemetry) {
            tracing::debug!("Telemetry parser {} rejected '{}': {}", parser.name, line, e);
        }
    }
    matched
}

/// Registers every parser on `router`, writing into the store's current snapshot.
pub fn register_parsers(router: &OutputRouter, store: &Arc<TelemetryStore>) -> Result<(), ParseError> {
    for parser in field_parsers()? {
        let store = store.clone();
        let pattern = parser.pattern.clone();
        router.register(pattern, move |found| {
            let mut result = Ok(());
            store.update(|telemetry| result = parser.apply(found, telemetry));
            result.map_err(Into::into)
        });
    }
    Ok(())
}

fn number<T: FromStr>(found: &LineMatch, index: usize) -> Result<T, ParseError> {
    let raw = found.group(index).ok_or(ParseError::MissingGroup(index))?;
    raw.parse()
        .map_err(|_| ParseError::InvalidNumber(raw.to_string()))
}

fn temperature(found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
    telemetry.temp_nozzle = Some(number(found, 1)?);
    telemetry.target_nozzle = Some(number(found, 2)?);
    telemetry.temp_bed = Some(number(found, 3)?);
    telemetry.target_bed = Some(number(found, 4)?);
    Ok(())
}

// The first X/Y/Z triple is the planner target; Count is where the axes are.
fn position(found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
    telemetry.axis_x = Some(number(found, 5)?);
    telemetry.axis_y = Some(number(found, 6)?);
    telemetry.axis_z = Some(number(found, 7)?);
    Ok(())
}

fn e_fan(found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
    telemetry.e_fan = Some(number(found, 1)?);
    Ok(())
}

fn p_fan(found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
    telemetry.p_fan = Some(number(found, 1)?);
    Ok(())
}

/// `hh:mm` elapsed; "Not SD printing" leaves the field alone.
fn print_time(found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
    if found.group(2).is_none() {
        return Ok(());
    }
    let hours: u64 = number(found, 3)?;
    let minutes: u64 = number(found, 4)?;
    let seconds = hours
        .checked_mul(3600)
        .zip(minutes.checked_mul(60))
        .and_then(|(hours, minutes)| hours.checked_add(minutes))
        .ok_or_else(|| ParseError::InvalidNumber(found.line().to_string()))?;
    telemetry.printing_time = Some(seconds);
    Ok(())
}

fn progress(found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
    let percent: u32 = number(found, 1)?;
    if percent <= 100 {
        telemetry.progress = Some(percent as u8);
    }
    Ok(())
}

// Silent mode figures are the more conservative estimate.
fn time_remaining(found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
    let minutes: i64 = number(found, 2)?;
    if minutes >= 0 {
        let seconds = (minutes as u64)
            .checked_mul(60)
            .ok_or_else(|| ParseError::InvalidNumber(found.line().to_string()))?;
        telemetry.estimated_time = Some(seconds);
    }
    Ok(())
}

fn heating(found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
    telemetry.temp_nozzle = Some(number(found, 1)?);
    telemetry.temp_bed = Some(number(found, 2)?);
    Ok(())
}

fn heating_hotend(found: &LineMatch, telemetry: &mut Telemetry) -> Result<(), ParseError> {
    telemetry.temp_nozzle = Some(number(found, 1)?);
    Ok(())
}
