//! Feeds firmware signals into the state manager.
//!
//! Busy, attention and error lines are recognised on the output router;
//! link health comes from the serial queue's signal subscription.

use super::{StateEvent, StateManager};
use crate::serial::{OutputRouter, QueueSignal};
use crate::shutdown::ShutdownToken;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const BUSY_PATTERN: &str = r"^echo:busy: processing$";
pub const ATTENTION_PATTERN: &str = r"^echo:busy: paused for (user|input)$";
pub const ERROR_PATTERN: &str = r"^Error:(.*)$";

/// Registers the busy/attention/error line handlers on `router`.
pub fn register_firmware_signals(
    router: &OutputRouter,
    state: &Arc<StateManager>,
) -> Result<(), regex::Error> {
    let busy = state.clone();
    router.register(Regex::new(BUSY_PATTERN)?, move |_| {
        busy.handle(StateEvent::BusyDetected);
        Ok(())
    });

    let attention = state.clone();
    router.register(Regex::new(ATTENTION_PATTERN)?, move |found| {
        tracing::info!("Printer waiting for {}", found.group(1).unwrap_or("user"));
        attention.handle(StateEvent::AttentionRequired);
        Ok(())
    });

    let error = state.clone();
    router.register(Regex::new(ERROR_PATTERN)?, move |found| {
        tracing::warn!("Firmware error: {}", found.group(1).unwrap_or_default());
        error.handle(StateEvent::ErrorDetected);
        Ok(())
    });
    Ok(())
}

pub fn queue_signal_event(signal: &QueueSignal) -> StateEvent {
    match signal {
        QueueSignal::Responsive => StateEvent::BusyCleared,
        QueueSignal::Degraded { .. } => StateEvent::CommunicationDegraded,
        QueueSignal::Recovered => StateEvent::CommunicationRecovered,
    }
}

/// Forwards queue health signals until `token` is cancelled or the queue
/// goes away.
pub fn spawn_queue_bridge(
    mut signals: mpsc::UnboundedReceiver<QueueSignal>,
    state: Arc<StateManager>,
    token: ShutdownToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => {
                        state.handle(queue_signal_event(&signal));
                    }
                    None => break,
                },
                _ = token.cancelled() => break,
            }
        }
        tracing::debug!("Queue signal bridge stopped");
    })
}
