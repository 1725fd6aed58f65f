// src/state/mod.rs - Canonical printer operational state
//!
//! The [`StateManager`] is the only owner of the printer state. Job intent
//! (print started, paused, ...) and firmware signals (busy, attention, link
//! health) are fed in as [`StateEvent`]s; everyone else reads copies through
//! [`StateManager::snapshot`] or listens for [`StateChange`]s.

pub mod signals;

use crate::config::StateConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BaseState {
    Ready,
    Busy,
    Error,
    Attention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrintingState {
    Printing,
    Paused,
    Finishing,
}

/// The single externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrinterState {
    Ready,
    Busy,
    Error,
    Attention,
    Printing,
    Paused,
    Finishing,
}

impl PrinterState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Busy => "BUSY",
            Self::Error => "ERROR",
            Self::Attention => "ATTENTION",
            Self::Printing => "PRINTING",
            Self::Paused => "PAUSED",
            Self::Finishing => "FINISHING",
        }
    }
}

impl std::fmt::Display for PrinterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<BaseState> for PrinterState {
    fn from(state: BaseState) -> Self {
        match state {
            BaseState::Ready => Self::Ready,
            BaseState::Busy => Self::Busy,
            BaseState::Error => Self::Error,
            BaseState::Attention => Self::Attention,
        }
    }
}

impl From<PrintingState> for PrinterState {
    fn from(state: PrintingState) -> Self {
        match state {
            PrintingState::Printing => Self::Printing,
            PrintingState::Paused => Self::Paused,
            PrintingState::Finishing => Self::Finishing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEvent {
    PrintStarted,
    PrintPaused,
    PrintResumed,
    PrintFinished,
    PrintFailed,
    /// A finished job was acknowledged.
    JobCleared,
    BusyDetected,
    BusyCleared,
    AttentionRequired,
    AttentionCleared,
    ErrorDetected,
    ErrorCleared,
    CommunicationDegraded,
    CommunicationRecovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub old: PrinterState,
    pub new: PrinterState,
}

/// Override first, then a non-READY base state, then the print phase.
pub fn reported_state(
    base: BaseState,
    printing: Option<PrintingState>,
    override_state: Option<PrinterState>,
) -> PrinterState {
    if let Some(state) = override_state {
        return state;
    }
    if base != BaseState::Ready {
        return base.into();
    }
    printing.map_or(PrinterState::Ready, PrinterState::from)
}

/// Point-in-time copy of the state manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub reported_state: PrinterState,
    pub base_state: BaseState,
    pub printing_state: Option<PrintingState>,
    pub override_state: Option<PrinterState>,
    pub busy: bool,
    pub attention: bool,
    pub error: bool,
    pub error_count: u32,
    pub history: Vec<PrinterState>,
}

#[derive(Debug)]
struct Conditions {
    busy: bool,
    attention: bool,
    error: bool,
    error_count: u32,
    printing_state: Option<PrintingState>,
    override_state: Option<PrinterState>,
    history: VecDeque<PrinterState>,
    subscribers: Vec<mpsc::UnboundedSender<StateChange>>,
}

impl Conditions {
    fn base_state(&self, error_threshold: u32) -> BaseState {
        if self.busy {
            BaseState::Busy
        } else if self.attention || self.error_count > error_threshold {
            BaseState::Attention
        } else if self.error {
            BaseState::Error
        } else {
            BaseState::Ready
        }
    }

    fn reported(&self, error_threshold: u32) -> PrinterState {
        reported_state(
            self.base_state(error_threshold),
            self.printing_state,
            self.override_state,
        )
    }

    /// Applies `event`. Returns `false` when it does not apply in the
    /// current print phase.
    fn apply(&mut self, event: StateEvent) -> bool {
        use PrintingState::*;
        match event {
            StateEvent::PrintStarted => {
                self.printing_state = Some(Printing);
                self.error = false;
            }
            StateEvent::PrintPaused => {
                if self.printing_state != Some(Printing) {
                    return false;
                }
                self.printing_state = Some(Paused);
            }
            StateEvent::PrintResumed => {
                if self.printing_state != Some(Paused) {
                    return false;
                }
                self.printing_state = Some(Printing);
            }
            StateEvent::PrintFinished => {
                if !matches!(self.printing_state, Some(Printing | Paused)) {
                    return false;
                }
                self.printing_state = Some(Finishing);
            }
            StateEvent::PrintFailed => {
                self.printing_state = None;
                self.error = true;
            }
            StateEvent::JobCleared => {
                if self.printing_state != Some(Finishing) {
                    return false;
                }
                self.printing_state = None;
            }
            StateEvent::BusyDetected => self.busy = true,
            StateEvent::BusyCleared => self.busy = false,
            StateEvent::AttentionRequired => {
                self.attention = true;
                self.busy = false;
            }
            StateEvent::AttentionCleared => self.attention = false,
            StateEvent::ErrorDetected => self.error = true,
            StateEvent::ErrorCleared => self.error = false,
            StateEvent::CommunicationDegraded => {
                self.error_count = self.error_count.saturating_add(1);
            }
            StateEvent::CommunicationRecovered => self.error_count = 0,
        }
        true
    }
}

#[derive(Debug)]
pub struct StateManager {
    config: StateConfig,
    conditions: Mutex<Conditions>,
}

impl StateManager {
    pub fn new(config: StateConfig) -> Self {
        let mut history = VecDeque::with_capacity(config.history_length);
        history.push_back(PrinterState::Ready);
        Self {
            config,
            conditions: Mutex::new(Conditions {
                busy: false,
                attention: false,
                error: false,
                error_count: 0,
                printing_state: None,
                override_state: None,
                history,
                subscribers: Vec::new(),
            }),
        }
    }

    fn conditions(&self) -> MutexGuard<'_, Conditions> {
        self.conditions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds one event through the transition function. Returns the change
    /// of reported state, if there was one.
    pub fn handle(&self, event: StateEvent) -> Option<StateChange> {
        self.mutate(|conditions| {
            let applied = conditions.apply(event);
            if !applied {
                tracing::debug!(
                    "Ignoring {:?} while printing state is {:?}",
                    event,
                    conditions.printing_state
                );
            }
            applied
        })
    }

    /// Pins the reported state regardless of the underlying conditions.
    pub fn set_override(&self, state: PrinterState) -> Option<StateChange> {
        tracing::info!("State override set to {}", state);
        self.mutate(|conditions| {
            conditions.override_state = Some(state);
            true
        })
    }

    pub fn clear_override(&self) -> Option<StateChange> {
        tracing::info!("State override cleared");
        self.mutate(|conditions| conditions.override_state.take().is_some())
    }

    // Notifications go out while the lock is held so subscribers see
    // changes in the order they happened and never a half-applied one.
    fn mutate<F>(&self, f: F) -> Option<StateChange>
    where
        F: FnOnce(&mut Conditions) -> bool,
    {
        let threshold = self.config.error_threshold;
        let mut conditions = self.conditions();
        let old = conditions.reported(threshold);
        if !f(&mut conditions) {
            return None;
        }
        let new = conditions.reported(threshold);
        if old == new {
            return None;
        }

        let change = StateChange { old, new };
        tracing::info!("Printer state {} -> {}", old, new);
        if conditions.history.len() >= self.config.history_length {
            conditions.history.pop_front();
        }
        conditions.history.push_back(new);
        conditions
            .subscribers
            .retain(|tx| tx.send(change).is_ok());
        Some(change)
    }

    pub fn reported_state(&self) -> PrinterState {
        self.conditions().reported(self.config.error_threshold)
    }

    pub fn base_state(&self) -> BaseState {
        self.conditions().base_state(self.config.error_threshold)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let threshold = self.config.error_threshold;
        let conditions = self.conditions();
        StateSnapshot {
            reported_state: conditions.reported(threshold),
            base_state: conditions.base_state(threshold),
            printing_state: conditions.printing_state,
            override_state: conditions.override_state,
            busy: conditions.busy,
            attention: conditions.attention,
            error: conditions.error,
            error_count: conditions.error_count,
            history: conditions.history.iter().copied().collect(),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.conditions().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> StateManager {
        StateManager::new(StateConfig::default())
    }

    #[test]
    fn test_busy_preserves_print_phase() {
        let state = manager();
        assert_eq!(state.reported_state(), PrinterState::Ready);

        state.handle(StateEvent::PrintStarted);
        assert_eq!(state.reported_state(), PrinterState::Printing);
        state.handle(StateEvent::BusyDetected);
        assert_eq!(state.reported_state(), PrinterState::Busy);
        state.handle(StateEvent::BusyCleared);
        assert_eq!(state.reported_state(), PrinterState::Printing);
    }

    #[test]
    fn test_attention_cleared_only_explicitly() {
        let state = manager();
        state.handle(StateEvent::BusyDetected);
        state.handle(StateEvent::AttentionRequired);
        assert_eq!(state.reported_state(), PrinterState::Attention);

        for event in [
            StateEvent::BusyCleared,
            StateEvent::CommunicationRecovered,
            StateEvent::PrintStarted,
            StateEvent::ErrorCleared,
        ] {
            state.handle(event);
            assert_eq!(state.reported_state(), PrinterState::Attention, "after {:?}", event);
        }

        state.handle(StateEvent::AttentionCleared);
        assert_eq!(state.reported_state(), PrinterState::Printing);
    }

    #[test]
    fn test_busy_outranks_attention() {
        let state = manager();
        state.handle(StateEvent::AttentionRequired);
        state.handle(StateEvent::BusyDetected);
        assert_eq!(state.base_state(), BaseState::Busy);
        state.handle(StateEvent::BusyCleared);
        assert_eq!(state.base_state(), BaseState::Attention);
    }

    #[test]
    fn test_error_count_over_threshold_needs_attention() {
        let state = StateManager::new(StateConfig {
            error_threshold: 2,
            ..StateConfig::default()
        });
        state.handle(StateEvent::CommunicationDegraded);
        state.handle(StateEvent::CommunicationDegraded);
        assert_eq!(state.reported_state(), PrinterState::Ready);
        let change = state.handle(StateEvent::CommunicationDegraded);
        assert_eq!(
            change,
            Some(StateChange {
                old: PrinterState::Ready,
                new: PrinterState::Attention,
            })
        );
        assert_eq!(state.snapshot().error_count, 3);

        state.handle(StateEvent::CommunicationRecovered);
        assert_eq!(state.reported_state(), PrinterState::Ready);
        assert_eq!(state.snapshot().error_count, 0);
    }

    #[test]
    fn test_print_lifecycle() {
        let state = manager();
        assert_eq!(state.handle(StateEvent::PrintPaused), None);

        state.handle(StateEvent::PrintStarted);
        state.handle(StateEvent::PrintPaused);
        assert_eq!(state.reported_state(), PrinterState::Paused);
        state.handle(StateEvent::PrintResumed);
        state.handle(StateEvent::PrintFinished);
        assert_eq!(state.reported_state(), PrinterState::Finishing);
        state.handle(StateEvent::JobCleared);
        assert_eq!(state.reported_state(), PrinterState::Ready);

        state.handle(StateEvent::PrintStarted);
        state.handle(StateEvent::PrintFailed);
        assert_eq!(state.reported_state(), PrinterState::Error);
        state.handle(StateEvent::PrintStarted);
        assert_eq!(state.reported_state(), PrinterState::Printing);
    }

    #[test]
    fn test_override_wins_until_cleared() {
        let state = manager();
        state.handle(StateEvent::BusyDetected);
        state.set_override(PrinterState::Attention);
        assert_eq!(state.reported_state(), PrinterState::Attention);
        state.handle(StateEvent::BusyCleared);
        assert_eq!(state.reported_state(), PrinterState::Attention);
        assert_eq!(state.clear_override().map(|c| c.new), Some(PrinterState::Ready));
        assert_eq!(state.clear_override(), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let state = StateManager::new(StateConfig {
            history_length: 3,
            ..StateConfig::default()
        });
        for _ in 0..4 {
            state.handle(StateEvent::BusyDetected);
            state.handle(StateEvent::BusyCleared);
        }
        let history = state.snapshot().history;
        assert_eq!(history.len(), 3);
        assert_eq!(history.last(), Some(&PrinterState::Ready));
    }

    #[test]
    fn test_reported_state_is_pure() {
        let bases = [BaseState::Ready, BaseState::Busy, BaseState::Error, BaseState::Attention];
        let phases = [
            None,
            Some(PrintingState::Printing),
            Some(PrintingState::Paused),
            Some(PrintingState::Finishing),
        ];
        for base in bases {
            for phase in phases {
                let first = reported_state(base, phase, None);
                assert_eq!(first, reported_state(base, phase, None));
                if base == BaseState::Ready {
                    assert_eq!(first, phase.map_or(PrinterState::Ready, PrinterState::from));
                } else {
                    assert_eq!(first, PrinterState::from(base));
                }
                assert_eq!(
                    reported_state(base, phase, Some(PrinterState::Finishing)),
                    PrinterState::Finishing
                );
            }
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_changes_in_order() {
        let state = manager();
        let mut changes = state.subscribe();

        state.handle(StateEvent::PrintStarted);
        state.handle(StateEvent::BusyDetected);
        state.handle(StateEvent::BusyDetected);
        state.handle(StateEvent::BusyCleared);

        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push((change.old, change.new));
        }
        assert_eq!(
            seen,
            vec![
                (PrinterState::Ready, PrinterState::Printing),
                (PrinterState::Printing, PrinterState::Busy),
                (PrinterState::Busy, PrinterState::Printing),
            ]
        );
    }

    #[test]
    fn test_states_serialize_upper_case() {
        let json = serde_json::to_string(&PrinterState::Finishing).unwrap();
        assert_eq!(json, "\"FINISHING\"");
        let event: StateEvent = serde_json::from_str("\"busy_detected\"").unwrap();
        assert_eq!(event, StateEvent::BusyDetected);
    }
}
