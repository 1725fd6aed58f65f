//! Priority command queue that owns the serial link.
//!
//! A single scheduling task ([`SerialQueue::spawn`]) is the only writer to the
//! transport. It keeps at most one instruction outstanding, sends the front
//! tier before the normal tier (FIFO within each), feeds every line it reads
//! to the current instruction and hands the rest to the [`OutputRouter`].
//!
//! A caller may take the link over with [`SerialQueue::acquire_exclusive_write`];
//! while that grant is alive new submissions are answered with
//! [`Submission::WriteIgnored`] and nothing queued is sent.

use super::instruction::{FailureReason, Instruction, InstructionState, Priority, is_busy_line};
use super::router::OutputRouter;
use super::{Transport, TransportError};
use crate::config::QueueConfig;
use crate::shutdown::ShutdownToken;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type SharedTransport = Arc<AsyncMutex<Box<dyn Transport>>>;

/// Outcome of handing work to the queue.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission<T = ()> {
    Accepted(T),
    /// Exclusive write is held by someone else; the instruction was not queued.
    WriteIgnored,
}

impl<T> Submission<T> {
    pub fn is_write_ignored(&self) -> bool {
        matches!(self, Self::WriteIgnored)
    }

    pub fn accepted(self) -> Option<T> {
        match self {
            Self::Accepted(value) => Some(value),
            Self::WriteIgnored => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Serial queue is shut down")]
    Closed,
    #[error("Serial queue loop is already running")]
    AlreadyRunning,
    #[error("Instruction '{payload}' was already submitted (state {state:?})")]
    AlreadySubmitted {
        payload: String,
        state: InstructionState,
    },
}

/// Link health reported to subscribers of [`SerialQueue::subscribe_signals`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSignal {
    /// An instruction was confirmed.
    Responsive,
    Degraded {
        consecutive_failures: u32,
        reason: FailureReason,
    },
    /// First confirmation after a degraded period.
    Recovered,
}

#[derive(Default)]
struct Pending {
    front: VecDeque<Arc<Instruction>>,
    normal: VecDeque<Arc<Instruction>>,
    next_id: u64,
    consecutive_front: u32,
    closed: bool,
}

impl Pending {
    /// Next instruction to send. After `max_front` front sends in a row one
    /// normal instruction goes out if any is waiting.
    fn pop_next(&mut self, max_front: u32) -> Option<Arc<Instruction>> {
        let yield_to_normal =
            max_front > 0 && self.consecutive_front >= max_front && !self.normal.is_empty();
        if !yield_to_normal {
            if let Some(next) = self.front.pop_front() {
                self.consecutive_front += 1;
                return Some(next);
            }
        }
        let next = self.normal.pop_front()?;
        self.consecutive_front = 0;
        Some(next)
    }

    fn len(&self) -> usize {
        self.front.len() + self.normal.len()
    }
}

enum Outcome {
    Confirmed,
    TimedOut(FailureReason),
    TransportFailed(FailureReason),
    Skipped,
}

/// What the scheduling loop does next, decided under the pending lock.
enum Next {
    Exclusive,
    Send(Arc<Instruction>),
    Idle,
}

struct Shared {
    config: QueueConfig,
    pending: Mutex<Pending>,
    work: Notify,
    running: AtomicBool,
    exclusive: AtomicBool,
    exclusive_holder: Arc<AsyncMutex<()>>,
    transport: SharedTransport,
    router: Arc<OutputRouter>,
    current: Mutex<Option<Arc<Instruction>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<QueueSignal>>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next(&self) -> Next {
        let mut pending = self.pending();
        if self.exclusive.load(Ordering::SeqCst) {
            return Next::Exclusive;
        }
        match pending.pop_next(self.config.max_consecutive_front) {
            Some(instruction) => Next::Send(instruction),
            None => Next::Idle,
        }
    }

    fn set_current(&self, instruction: Option<Arc<Instruction>>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = instruction;
    }

    fn publish(&self, signal: QueueSignal) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(signal.clone()).is_ok());
    }

    /// Reads while nothing is in flight so spontaneous firmware output is
    /// still routed. Returns early when new work arrives.
    async fn idle(&self, token: &ShutdownToken) -> Result<(), TransportError> {
        let mut transport = self.transport.lock().await;
        tokio::select! {
            _ = self.work.notified() => Ok(()),
            _ = token.cancelled() => Ok(()),
            read = transport.read_line(self.config.idle_poll()) => {
                if let Some(line) = read? {
                    self.router.dispatch(&line);
                }
                Ok(())
            }
        }
    }

    async fn process(&self, instruction: &Arc<Instruction>, token: &ShutdownToken) -> Outcome {
        let mut transport = self.transport.lock().await;
        // Marked before writing so a concurrent cancel cannot race the write.
        if let Err(e) = instruction.mark_sent() {
            debug!("Skipping instruction '{}': {}", instruction.payload(), e);
            return Outcome::Skipped;
        }
        self.set_current(Some(instruction.clone()));
        let outcome = self.exchange(&mut **transport, instruction, token).await;
        self.set_current(None);
        outcome
    }

    async fn exchange(
        &self,
        transport: &mut dyn Transport,
        instruction: &Arc<Instruction>,
        token: &ShutdownToken,
    ) -> Outcome {
        debug!(
            "Sending instruction #{}: {}",
            instruction.id().unwrap_or_default(),
            instruction.payload()
        );
        if let Err(e) = transport.write_line(instruction.payload()).await {
            let reason = FailureReason::Transport(e.to_string());
            instruction.resolve_failed(reason.clone());
            return Outcome::TransportFailed(reason);
        }

        // Once shutdown is requested the instruction still gets to resolve,
        // but busy keep-alives no longer push the deadline out.
        let timeout = self.config.instruction_timeout();
        let mut deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let reason = FailureReason::Timeout(timeout);
                instruction.resolve_failed(reason.clone());
                return Outcome::TimedOut(reason);
            }
            match transport.read_line(remaining).await {
                Ok(Some(line)) => {
                    if instruction.capture_line(&line) {
                        return Outcome::Confirmed;
                    }
                    if is_busy_line(&line) && !token.is_cancelled() {
                        deadline = Instant::now() + timeout;
                    }
                    self.router.dispatch(&line);
                }
                Ok(None) => {}
                Err(e) => {
                    let reason = FailureReason::Transport(e.to_string());
                    instruction.resolve_failed(reason.clone());
                    return Outcome::TransportFailed(reason);
                }
            }
        }
    }

    /// Refuses further submissions and cancels everything still pending.
    fn close(&self) -> usize {
        let drained: Vec<Arc<Instruction>> = {
            let mut pending = self.pending();
            pending.closed = true;
            let mut drained: Vec<_> = pending.front.drain(..).collect();
            drained.extend(pending.normal.drain(..));
            drained
        };
        for instruction in &drained {
            let _ = instruction.cancel();
        }
        drained.len()
    }
}

/// Consecutive-failure bookkeeping for the scheduling loop.
#[derive(Debug, Default)]
struct Health {
    failures: u32,
    transport_failures: u32,
    degraded: bool,
}

async fn run(shared: Arc<Shared>, token: ShutdownToken) {
    info!("Serial queue started");
    let mut health = Health::default();

    loop {
        if token.is_cancelled() {
            break;
        }

        let outcome = match shared.next() {
            Next::Exclusive => {
                tokio::select! {
                    _ = shared.work.notified() => {}
                    _ = token.cancelled() => {}
                }
                continue;
            }
            Next::Send(instruction) => shared.process(&instruction, &token).await,
            Next::Idle => match shared.idle(&token).await {
                Ok(()) => continue,
                Err(e) => Outcome::TransportFailed(FailureReason::Transport(e.to_string())),
            },
        };

        match outcome {
            Outcome::Confirmed => {
                health.failures = 0;
                health.transport_failures = 0;
                if health.degraded {
                    health.degraded = false;
                    info!("Serial link recovered");
                    shared.publish(QueueSignal::Recovered);
                }
                shared.publish(QueueSignal::Responsive);
            }
            Outcome::TimedOut(reason) => {
                health.failures += 1;
                warn!("Instruction failed: {} ({} in a row)", reason, health.failures);
                if health.failures >= shared.config.failure_threshold {
                    health.degraded = true;
                    shared.publish(QueueSignal::Degraded {
                        consecutive_failures: health.failures,
                        reason,
                    });
                }
            }
            Outcome::TransportFailed(reason) => {
                health.failures += 1;
                health.transport_failures += 1;
                health.degraded = true;
                error!("Serial transport failure: {}", reason);
                shared.publish(QueueSignal::Degraded {
                    consecutive_failures: health.failures,
                    reason,
                });
                let delay = shared.config.backoff(health.transport_failures);
                debug!("Backing off for {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {}
                }
            }
            Outcome::Skipped => {}
        }
    }

    let cancelled = shared.close();
    info!("Serial queue stopped, cancelled {} pending instructions", cancelled);
}

/// Handle to the command queue. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct SerialQueue {
    shared: Arc<Shared>,
}

impl SerialQueue {
    pub fn new(transport: Box<dyn Transport>, router: Arc<OutputRouter>, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                pending: Mutex::new(Pending::default()),
                work: Notify::new(),
                running: AtomicBool::new(false),
                exclusive: AtomicBool::new(false),
                exclusive_holder: Arc::new(AsyncMutex::new(())),
                transport: Arc::new(AsyncMutex::new(transport)),
                router,
                current: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts the scheduling loop. It runs until `token` is cancelled, then
    /// cancels whatever is still pending.
    pub fn spawn(&self, token: ShutdownToken) -> Result<JoinHandle<()>, QueueError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyRunning);
        }
        Ok(tokio::spawn(run(self.shared.clone(), token)))
    }

    pub fn enqueue(&self, instruction: Arc<Instruction>) -> Result<Submission, QueueError> {
        {
            // The exclusive flag only changes under this lock, so nothing can
            // slip into the queue once a grant has been handed out.
            let mut pending = self.shared.pending();
            if self.shared.exclusive.load(Ordering::SeqCst) {
                debug!("Write ignored, exclusive write held: {}", instruction.payload());
                return Ok(Submission::WriteIgnored);
            }
            if pending.closed {
                return Err(QueueError::Closed);
            }
            if instruction.state() != InstructionState::Pending || instruction.id().is_some() {
                return Err(QueueError::AlreadySubmitted {
                    payload: instruction.payload().to_string(),
                    state: instruction.state(),
                });
            }
            pending.next_id += 1;
            instruction.assign_id(pending.next_id);
            match instruction.priority() {
                Priority::Front => pending.front.push_back(instruction),
                Priority::Normal => pending.normal.push_back(instruction),
            }
        }
        self.shared.work.notify_one();
        Ok(Submission::Accepted(()))
    }

    /// Enqueues `instruction` and waits until it resolves or `timeout` elapses.
    pub async fn enqueue_and_wait(
        &self,
        instruction: &Arc<Instruction>,
        timeout: Option<Duration>,
    ) -> Result<Submission<InstructionState>, QueueError> {
        match self.enqueue(instruction.clone())? {
            Submission::WriteIgnored => Ok(Submission::WriteIgnored),
            Submission::Accepted(()) => Ok(Submission::Accepted(instruction.wait(timeout).await)),
        }
    }

    /// Takes the link over. Waits for the in-flight instruction (and any
    /// earlier holder) to finish first.
    pub async fn acquire_exclusive_write(&self) -> ExclusiveWrite {
        let holder = self.shared.exclusive_holder.clone().lock_owned().await;
        {
            let _pending = self.shared.pending();
            self.shared.exclusive.store(true, Ordering::SeqCst);
        }
        let flag = ExclusiveFlag {
            shared: self.shared.clone(),
        };
        // Wake the loop out of an idle read so it lets go of the transport.
        self.shared.work.notify_one();
        let transport = self.shared.transport.clone().lock_owned().await;
        info!("Exclusive write acquired");
        ExclusiveWrite {
            transport,
            router: self.shared.router.clone(),
            _flag: flag,
            _holder: holder,
        }
    }

    /// How long an instruction may stay in flight without a busy keep-alive.
    pub fn instruction_timeout(&self) -> Duration {
        self.shared.config.instruction_timeout()
    }

    pub fn is_exclusive(&self) -> bool {
        self.shared.exclusive.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    /// The instruction currently in flight, if any.
    pub fn current(&self) -> Option<Arc<Instruction>> {
        self.shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn router(&self) -> &Arc<OutputRouter> {
        &self.shared.router
    }

    pub fn subscribe_signals(&self) -> mpsc::UnboundedReceiver<QueueSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("pending", &self.pending_len())
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}

struct ExclusiveFlag {
    shared: Arc<Shared>,
}

impl Drop for ExclusiveFlag {
    fn drop(&mut self) {
        {
            let _pending = self.shared.pending();
            self.shared.exclusive.store(false, Ordering::SeqCst);
        }
        self.shared.work.notify_one();
    }
}

/// Sole access to the transport. Queued work resumes when this is dropped.
pub struct ExclusiveWrite {
    // Field order matters: the transport is unlocked before the flag clears.
    transport: OwnedMutexGuard<Box<dyn Transport>>,
    router: Arc<OutputRouter>,
    _flag: ExclusiveFlag,
    _holder: OwnedMutexGuard<()>,
}

impl ExclusiveWrite {
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.transport.write_line(line).await
    }

    pub async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        self.transport.read_line(timeout).await
    }

    /// Passes a line the holder does not care about to the output router.
    pub fn route_line(&self, line: &str) -> usize {
        self.router.dispatch(line)
    }
}

impl Drop for ExclusiveWrite {
    fn drop(&mut self) {
        info!("Exclusive write released");
    }
}

impl std::fmt::Debug for ExclusiveWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveWrite").finish_non_exhaustive()
    }
}
