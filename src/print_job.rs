// src/print_job.rs - Streaming a local G-code file to the printer
//!
//! A file print takes the serial link over with an exclusive write grant and
//! sends one line at a time, waiting for the firmware's `ok` before the
//! next. While paused the grant is released so queued work (telemetry,
//! user commands) can run.

use crate::serial::{ExclusiveWrite, SerialQueue, TransportError, is_acknowledgement, is_busy_line};
use crate::shutdown::ShutdownToken;
use crate::state::{StateEvent, StateManager};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum PrintError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("No ok for line {line_number} '{line}' within {timeout:?}")]
    Timeout {
        line_number: usize,
        line: String,
        timeout: Duration,
    },
    #[error("Print stopped after {0} lines")]
    Stopped(usize),
    #[error("File contains no G-code")]
    Empty,
    #[error("Invalid job transition: {0}")]
    InvalidTransition(String),
    #[error("Print task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobControl {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrintSummary {
    pub lines_sent: usize,
    pub total_lines: usize,
}

/// Strips `;` comments and surrounding whitespace, dropping empty lines.
pub fn gcode_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split(';').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Running file print.
#[derive(Debug)]
pub struct PrintHandle {
    control: watch::Sender<JobControl>,
    task: JoinHandle<Result<PrintSummary, PrintError>>,
    total_lines: usize,
}

impl PrintHandle {
    pub fn pause(&self) -> Result<(), PrintError> {
        self.request(JobControl::Pause, &[JobControl::Run])
    }

    pub fn resume(&self) -> Result<(), PrintError> {
        self.request(JobControl::Run, &[JobControl::Pause])
    }

    pub fn stop(&self) -> Result<(), PrintError> {
        self.request(JobControl::Stop, &[JobControl::Run, JobControl::Pause])
    }

    fn request(&self, to: JobControl, from: &[JobControl]) -> Result<(), PrintError> {
        let mut current = to;
        let changed = self.control.send_if_modified(|control| {
            current = *control;
            if from.contains(control) {
                *control = to;
                true
            } else {
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(PrintError::InvalidTransition(format!("{:?} -> {:?}", current, to)))
        }
    }

    pub fn control(&self) -> JobControl {
        *self.control.borrow()
    }

    pub fn total_lines(&self) -> usize {
        self.total_lines
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<PrintSummary, PrintError> {
        self.task.await?
    }
}

/// Reads `path` and starts streaming it. Emits `print_started` right away and
/// `print_finished` or `print_failed` when the stream ends.
pub async fn start_print(
    queue: SerialQueue,
    state: Arc<StateManager>,
    path: &Path,
    timeout: Duration,
    token: ShutdownToken,
) -> Result<PrintHandle, PrintError> {
    let contents = tokio::fs::read_to_string(path).await?;
    let lines = gcode_lines(&contents);
    if lines.is_empty() {
        return Err(PrintError::Empty);
    }
    tracing::info!("Starting print of {} ({} lines)", path.display(), lines.len());
    Ok(spawn_print(queue, state, lines, timeout, token))
}

pub fn spawn_print(
    queue: SerialQueue,
    state: Arc<StateManager>,
    lines: Vec<String>,
    timeout: Duration,
    token: ShutdownToken,
) -> PrintHandle {
    let (control, control_rx) = watch::channel(JobControl::Run);
    let total_lines = lines.len();
    state.handle(StateEvent::PrintStarted);

    let task = tokio::spawn(async move {
        let streamer = Streamer {
            queue,
            state: state.clone(),
            lines,
            timeout,
            control: control_rx,
            token,
        };
        let result = streamer.run().await;
        match &result {
            Ok(summary) => {
                tracing::info!("Print finished, {} lines sent", summary.lines_sent);
                state.handle(StateEvent::PrintFinished);
            }
            Err(e) => {
                tracing::error!("Print failed: {}", e);
                state.handle(StateEvent::PrintFailed);
            }
        }
        result
    });

    PrintHandle {
        control,
        task,
        total_lines,
    }
}

struct Streamer {
    queue: SerialQueue,
    state: Arc<StateManager>,
    lines: Vec<String>,
    timeout: Duration,
    control: watch::Receiver<JobControl>,
    token: ShutdownToken,
}

impl Streamer {
    async fn run(mut self) -> Result<PrintSummary, PrintError> {
        let mut sent = 0;
        while sent < self.lines.len() {
            self.wait_while_paused(sent).await?;

            let mut link = self.queue.acquire_exclusive_write().await;
            while sent < self.lines.len() {
                match *self.control.borrow() {
                    JobControl::Run => {}
                    JobControl::Pause => break,
                    JobControl::Stop => return Err(PrintError::Stopped(sent)),
                }
                if self.token.is_cancelled() {
                    return Err(PrintError::Stopped(sent));
                }
                self.send_line(&mut link, sent).await?;
                sent += 1;
            }
        }
        Ok(PrintSummary {
            lines_sent: sent,
            total_lines: self.lines.len(),
        })
    }

    async fn wait_while_paused(&mut self, sent: usize) -> Result<(), PrintError> {
        if *self.control.borrow() != JobControl::Pause {
            return Ok(());
        }
        self.state.handle(StateEvent::PrintPaused);
        tracing::info!("Print paused after {} lines", sent);
        tokio::select! {
            resumed = self.control.wait_for(|control| *control != JobControl::Pause) => {
                if resumed.is_err() {
                    return Err(PrintError::Stopped(sent));
                }
            }
            _ = self.token.cancelled() => return Err(PrintError::Stopped(sent)),
        }
        if *self.control.borrow() == JobControl::Stop {
            return Err(PrintError::Stopped(sent));
        }
        self.state.handle(StateEvent::PrintResumed);
        tracing::info!("Print resumed");
        Ok(())
    }

    async fn send_line(&self, link: &mut ExclusiveWrite, index: usize) -> Result<(), PrintError> {
        let line = &self.lines[index];
        link.write_line(line).await?;
        // Long moves and heating report busy until done; each report restarts the wait.
        let mut deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PrintError::Timeout {
                    line_number: index + 1,
                    line: line.clone(),
                    timeout: self.timeout,
                });
            }
            match link.read_line(remaining).await? {
                Some(reply) if is_acknowledgement(&reply) => {
                    self.state.handle(StateEvent::BusyCleared);
                    return Ok(());
                }
                Some(reply) => {
                    if is_busy_line(&reply) {
                        deadline = Instant::now() + self.timeout;
                    }
                    link.route_line(&reply);
                }
                None => {}
            }
        }
    }
}
