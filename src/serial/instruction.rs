//! One outbound firmware line together with its expected-response contract.
//!
//! An [`Instruction`] moves through
//! `Pending -> Sent -> {Confirmed, Failed, Cancelled}` exactly once. The
//! submitter keeps an `Arc` to it and observes the outcome with
//! [`Instruction::wait`]; the queue holds a clone only while it is pending or
//! in flight.

use crate::shutdown::ShutdownToken;
use regex::{Captures, Regex};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    /// Sent ahead of all normal traffic, FIFO among other front instructions.
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstructionState {
    Pending,
    Sent,
    Confirmed,
    Failed,
    Cancelled,
}

impl InstructionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("No matching response within {0:?}")]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstructionError {
    #[error("Invalid instruction transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: InstructionState,
        to: InstructionState,
    },
}

/// A firmware line that satisfied a pattern, with its capture groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineMatch {
    line: String,
    groups: Vec<Option<String>>,
}

impl LineMatch {
    pub fn from_captures(line: &str, captures: &Captures<'_>) -> Self {
        let groups = captures
            .iter()
            .skip(1)
            .map(|group| group.map(|m| m.as_str().to_string()))
            .collect();
        Self {
            line: line.to_string(),
            groups,
        }
    }

    /// Matches `pattern` against `line`, returning `None` when it does not match.
    pub fn find(pattern: &Regex, line: &str) -> Option<Self> {
        pattern
            .captures(line)
            .map(|captures| Self::from_captures(line, &captures))
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// Capture group by regex index, so the first group is `group(1)`.
    pub fn group(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.groups.get(i))
            .and_then(|g| g.as_deref())
    }

    pub fn groups(&self) -> &[Option<String>] {
        &self.groups
    }
}

/// Firmware acknowledgement of a processed line (`ok`, `ok T:...`).
pub fn is_acknowledgement(line: &str) -> bool {
    line.starts_with("ok")
}

/// Keep-alive the firmware prints while a long command (heating, homing,
/// waiting for the user) is still running.
pub fn is_busy_line(line: &str) -> bool {
    line.starts_with("echo:busy:")
}

#[derive(Debug, Default)]
struct Record {
    output: Vec<String>,
    matched: Option<LineMatch>,
    failure: Option<FailureReason>,
}

#[derive(Debug)]
pub struct Instruction {
    id: OnceLock<u64>,
    payload: String,
    matcher: Option<Regex>,
    priority: Priority,
    state: watch::Sender<InstructionState>,
    // Every state transition happens while this lock is held, so the record
    // and the published state never disagree.
    record: Mutex<Record>,
}

impl Instruction {
    pub fn new(payload: impl Into<String>, matcher: Option<Regex>, priority: Priority) -> Arc<Self> {
        let (state, _) = watch::channel(InstructionState::Pending);
        Arc::new(Self {
            id: OnceLock::new(),
            payload: payload.into(),
            matcher,
            priority,
            state,
            record: Mutex::new(Record::default()),
        })
    }

    /// Normal-priority instruction confirmed by the first line read after sending.
    pub fn plain(payload: impl Into<String>) -> Arc<Self> {
        Self::new(payload, None, Priority::Normal)
    }

    /// Normal-priority instruction confirmed by the first line matching `matcher`.
    pub fn matchable(payload: impl Into<String>, matcher: Regex) -> Arc<Self> {
        Self::new(payload, Some(matcher), Priority::Normal)
    }

    /// Submission sequence number, assigned when the queue accepts it.
    pub fn id(&self) -> Option<u64> {
        self.id.get().copied()
    }

    pub(crate) fn assign_id(&self, id: u64) {
        let _ = self.id.set(id);
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn matcher(&self) -> Option<&Regex> {
        self.matcher.as_ref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> InstructionState {
        *self.state.borrow()
    }

    pub fn is_resolved(&self) -> bool {
        self.state().is_terminal()
    }

    /// Every line read while this instruction was current, in arrival order.
    pub fn output(&self) -> Vec<String> {
        self.record().output.clone()
    }

    pub fn matched(&self) -> Option<LineMatch> {
        self.record().matched.clone()
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.record().failure.clone()
    }

    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves `from -> to` atomically; returns the state found if it was not `from`.
    fn transition(&self, from: &[InstructionState], to: InstructionState) -> Result<(), InstructionState> {
        let mut found = to;
        let changed = self.state.send_if_modified(|state| {
            found = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed { Ok(()) } else { Err(found) }
    }

    pub fn mark_sent(&self) -> Result<(), InstructionError> {
        let _record = self.record();
        self.transition(&[InstructionState::Pending], InstructionState::Sent)
            .map_err(|from| InstructionError::InvalidTransition {
                from,
                to: InstructionState::Sent,
            })
    }

    /// Records a line read while this instruction is current. Returns `true`
    /// when the line resolved the instruction: a match of the matcher, or an
    /// acknowledgement when there is none.
    pub fn capture_line(&self, line: &str) -> bool {
        let mut record = self.record();
        if self.state() != InstructionState::Sent {
            return false;
        }
        record.output.push(line.to_string());

        let found = match &self.matcher {
            Some(pattern) => match LineMatch::find(pattern, line) {
                Some(found) => Some(found),
                None => return false,
            },
            None if is_acknowledgement(line) => None,
            None => return false,
        };
        if self
            .transition(&[InstructionState::Sent], InstructionState::Confirmed)
            .is_err()
        {
            return false;
        }
        record.matched = found;
        true
    }

    /// Forces the instruction to `Failed`. Returns `false` if it was already resolved.
    pub fn resolve_failed(&self, reason: FailureReason) -> bool {
        let mut record = self.record();
        let resolved = self
            .transition(
                &[InstructionState::Pending, InstructionState::Sent],
                InstructionState::Failed,
            )
            .is_ok();
        if resolved {
            record.failure = Some(reason);
        }
        resolved
    }

    /// Withdraws a pending instruction. Once sent it can no longer be cancelled.
    pub fn cancel(&self) -> Result<(), InstructionError> {
        let _record = self.record();
        self.transition(&[InstructionState::Pending], InstructionState::Cancelled)
            .map_err(|from| InstructionError::InvalidTransition {
                from,
                to: InstructionState::Cancelled,
            })
    }

    /// Waits until the instruction is resolved or `timeout` elapses, and
    /// returns the state at that point.
    pub async fn wait(&self, timeout: Option<Duration>) -> InstructionState {
        let mut rx = self.state.subscribe();
        let resolved = rx.wait_for(|state| state.is_terminal());
        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, resolved).await;
            }
            None => {
                let _ = resolved.await;
            }
        }
        self.state()
    }

    /// Like [`Instruction::wait`] but also gives up once `token` is cancelled.
    pub async fn wait_cancellable(&self, token: &ShutdownToken, timeout: Option<Duration>) -> InstructionState {
        tokio::select! {
            state = self.wait(timeout) => state,
            _ = token.cancelled() => self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;

    #[test]
    fn test_lifecycle_rejects_invalid_transitions() {
        let instruction = Instruction::plain("G28");
        assert_eq!(instruction.state(), InstructionState::Pending);
        instruction.mark_sent().unwrap();
        assert_eq!(
            instruction.mark_sent(),
            Err(InstructionError::InvalidTransition {
                from: InstructionState::Sent,
                to: InstructionState::Sent,
            })
        );
        assert!(instruction.cancel().is_err());
    }

    #[test]
    fn test_capture_ignored_before_sent() {
        let instruction = Instruction::plain("M105");
        assert!(!instruction.capture_line("ok"));
        assert!(instruction.output().is_empty());
        assert_eq!(instruction.state(), InstructionState::Pending);
    }

    #[test]
    fn test_without_matcher_ok_confirms() {
        let instruction = Instruction::plain("G1 X10");
        instruction.mark_sent().unwrap();
        assert!(!instruction.capture_line("echo:busy: processing"));
        assert!(!instruction.capture_line("echo:something"));
        assert_eq!(instruction.state(), InstructionState::Sent);
        assert!(instruction.capture_line("ok"));
        assert_eq!(instruction.state(), InstructionState::Confirmed);
        assert!(instruction.matched().is_none());
        // Resolved instructions take no further lines.
        assert!(!instruction.capture_line("ok"));
        assert_eq!(
            instruction.output(),
            vec!["echo:busy: processing", "echo:something", "ok"]
        );
    }

    #[test]
    fn test_line_classification() {
        assert!(is_acknowledgement("ok"));
        assert!(is_acknowledgement("ok T:215.0 /215.0"));
        assert!(!is_acknowledgement("echo:busy: processing"));
        assert!(is_busy_line("echo:busy: processing"));
        assert!(is_busy_line("echo:busy: paused for user"));
        assert!(!is_busy_line("echo:SD card ok"));
    }

    #[test]
    fn test_matcher_captures_groups() {
        let instruction = Instruction::matchable("M115", Regex::new(r"FW:(\d+\.\d+)").unwrap());
        instruction.mark_sent().unwrap();
        assert!(!instruction.capture_line("echo:busy: processing"));
        assert_eq!(instruction.state(), InstructionState::Sent);
        assert!(instruction.capture_line("FW:3.10"));
        assert_eq!(instruction.state(), InstructionState::Confirmed);

        let matched = instruction.matched().unwrap();
        assert_eq!(matched.group(1), Some("3.10"));
        assert_eq!(matched.group(0), None);
        assert_eq!(matched.line(), "FW:3.10");
        assert_eq!(instruction.output().len(), 2);
    }

    #[test]
    fn test_resolution_happens_once() {
        let instruction = Instruction::plain("M400");
        instruction.mark_sent().unwrap();
        assert!(instruction.resolve_failed(FailureReason::Timeout(Duration::from_secs(1))));
        assert!(!instruction.resolve_failed(FailureReason::Transport("gone".into())));
        assert!(!instruction.capture_line("ok"));
        assert_eq!(instruction.state(), InstructionState::Failed);
        assert_eq!(
            instruction.failure(),
            Some(FailureReason::Timeout(Duration::from_secs(1)))
        );
    }

    #[test]
    fn test_cancel_only_from_pending() {
        let instruction = Instruction::new("M117 hi", None, Priority::Front);
        instruction.cancel().unwrap();
        assert_eq!(instruction.state(), InstructionState::Cancelled);
        assert!(instruction.mark_sent().is_err());
        assert!(!instruction.resolve_failed(FailureReason::Timeout(Duration::ZERO)));
    }

    #[tokio::test]
    async fn test_wait_returns_on_resolution() {
        let instruction = Instruction::plain("M105");
        instruction.mark_sent().unwrap();
        let waiter = tokio::spawn({
            let instruction = instruction.clone();
            async move { instruction.wait(None).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        instruction.capture_line("ok");
        assert_eq!(waiter.await.unwrap(), InstructionState::Confirmed);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_resolution() {
        let instruction = Instruction::plain("M105");
        instruction.mark_sent().unwrap();
        let state = instruction.wait(Some(Duration::from_millis(20))).await;
        assert_eq!(state, InstructionState::Sent);
    }

    #[tokio::test]
    async fn test_wait_cancellable_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let instruction = Instruction::plain("M105");
        let waiter = tokio::spawn({
            let instruction = instruction.clone();
            async move { instruction.wait_cancellable(&token, None).await }
        });
        shutdown.trigger();
        let state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, InstructionState::Pending);
    }
}
