// src/telemetry/mod.rs - Periodic status gathering
//!
//! The [`TelemetryPoller`] asks the printer for its status every interval
//! and accumulates the replies in a [`TelemetryStore`]. A cycle first
//! publishes what the previous cycle gathered, then starts a fresh snapshot,
//! so published telemetry always trails the queries by one cycle.

pub mod parsers;

use crate::config::TelemetryConfig;
use crate::serial::{Instruction, InstructionState, SerialQueue, Submission};
use crate::shutdown::ShutdownToken;
use crate::state::{BaseState, PrinterState, StateManager};
use chrono::{DateTime, Utc};
use parsers::{FieldParser, ParseError, TELEMETRY_QUERIES};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info};

pub const KEEP_ALIVE: &str = "PRUSA PING";

/// One cycle of best-effort status fields. Unset means "not observed".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_nozzle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_nozzle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_bed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_bed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e_fan: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_fan: Option<f64>,
    /// Seconds since the print started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub printing_time: Option<u64>,
    /// Seconds left, as estimated by the firmware.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PrinterState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl Telemetry {
    /// Drops fields the printer reports but that are meaningless in `state`.
    pub fn gate(&mut self, state: PrinterState) {
        let job_active = matches!(
            state,
            PrinterState::Printing | PrinterState::Paused | PrinterState::Finishing
        );
        if !job_active {
            self.printing_time = None;
            self.estimated_time = None;
            self.progress = None;
        }
        if state == PrinterState::Printing {
            self.axis_x = None;
            self.axis_y = None;
            self.axis_z = None;
        }
    }
}

#[derive(Debug, Default)]
struct Buffers {
    current: Telemetry,
    last: Option<Telemetry>,
    subscribers: Vec<mpsc::UnboundedSender<Telemetry>>,
}

/// The snapshot being filled and the last published one.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    buffers: Mutex<Buffers>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Telemetry),
    {
        f(&mut self.buffers().current);
    }

    pub fn current(&self) -> Telemetry {
        self.buffers().current.clone()
    }

    /// Last published snapshot, `None` until the first publish.
    pub fn last(&self) -> Option<Telemetry> {
        self.buffers().last.clone()
    }

    /// Gates and stamps the current snapshot, makes it `last`, hands it to
    /// subscribers and starts an empty one.
    pub fn publish(&self, state: PrinterState) -> Telemetry {
        let mut buffers = self.buffers();
        let mut published = std::mem::take(&mut buffers.current);
        published.gate(state);
        published.state = Some(state);
        published.published_at = Some(Utc::now());
        buffers.last = Some(published.clone());
        buffers
            .subscribers
            .retain(|tx| tx.send(published.clone()).is_ok());
        published
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Telemetry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.buffers().subscribers.push(tx);
        rx
    }
}

struct Query {
    gcode: &'static str,
    matcher: Regex,
}

pub struct TelemetryPoller {
    queue: SerialQueue,
    state: Arc<StateManager>,
    store: Arc<TelemetryStore>,
    parsers: Vec<FieldParser>,
    queries: Vec<Query>,
    interval: Duration,
}

impl TelemetryPoller {
    pub fn new(
        queue: SerialQueue,
        state: Arc<StateManager>,
        store: Arc<TelemetryStore>,
        config: &TelemetryConfig,
    ) -> Result<Self, ParseError> {
        let queries = TELEMETRY_QUERIES
            .iter()
            .map(|&(gcode, pattern)| -> Result<Query, ParseError> {
                Ok(Query {
                    gcode,
                    matcher: Regex::new(pattern)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Self {
            queue,
            state,
            store,
            parsers: parsers::field_parsers()?,
            queries,
            interval: config.interval(),
        })
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    /// One polling cycle. Returns the instructions the queue accepted; status
    /// queries are resolved by the time this returns, a keep-alive is not
    /// waited for.
    pub async fn run_cycle(&self) -> Vec<Arc<Instruction>> {
        let published = self.store.publish(self.state.reported_state());
        debug!("Published telemetry: {:?}", published);

        if self.state.base_state() == BaseState::Busy {
            debug!("Printer seems busy, not asking for telemetry");
            return self.ping().into_iter().collect();
        }

        let mut issued = Vec::with_capacity(self.queries.len());
        for query in &self.queries {
            // Do not disturb a printer that turned busy mid-cycle.
            if self.state.base_state() == BaseState::Busy {
                break;
            }
            let instruction = Instruction::matchable(query.gcode, query.matcher.clone());
            match self.queue.enqueue(instruction.clone()) {
                Ok(Submission::Accepted(())) => issued.push(instruction),
                Ok(Submission::WriteIgnored) => {
                    debug!("Telemetry request got ignored, serial is exclusive for something else");
                }
                Err(e) => {
                    debug!("Telemetry request {} not queued: {}", query.gcode, e);
                    break;
                }
            }
        }

        // Replies are collected for one interval, or one instruction timeout
        // if that is longer. Requests still unsent by then are withdrawn.
        let deadline = Instant::now() + self.interval.max(self.queue.instruction_timeout());
        for instruction in &issued {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if instruction.wait(Some(remaining)).await == InstructionState::Pending
                && instruction.cancel().is_ok()
            {
                debug!("Telemetry request {} withdrawn unsent", instruction.payload());
            }
            if let Some(found) = instruction.matched() {
                self.store.update(|telemetry| {
                    parsers::fold_line(&self.parsers, found.line(), telemetry);
                });
            }
        }
        issued
    }

    /// Keep-alive for a busy printer. Its outcome is not interesting.
    fn ping(&self) -> Option<Arc<Instruction>> {
        let ping = Instruction::plain(KEEP_ALIVE);
        match self.queue.enqueue(ping.clone()) {
            Ok(Submission::Accepted(())) => Some(ping),
            Ok(Submission::WriteIgnored) => None,
            Err(e) => {
                debug!("Keep-alive not queued: {}", e);
                None
            }
        }
    }

    /// Runs cycles every interval until `token` is cancelled. Cancellation is
    /// only observed between cycles.
    pub fn spawn(self, token: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Telemetry poller started, interval {:?}", self.interval);
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => break,
                }
                self.run_cycle().await;
            }
            info!("Telemetry poller stopped");
        })
    }
}

impl std::fmt::Debug for TelemetryPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPoller")
            .field("interval", &self.interval)
            .field("queries", &self.queries.len())
            .finish()
    }
}
