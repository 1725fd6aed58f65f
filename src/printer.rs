// src/printer.rs - Wires the serial link, state machine and telemetry together
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::print_job::{self, PrintError, PrintHandle, PrintSummary};
use crate::probes::{self, PrinterInfo, ProbeError};
use crate::serial::{OutputRouter, QueueError, SerialQueue, Transport};
use crate::shutdown::{Shutdown, ShutdownToken};
use crate::state::{StateEvent, StateManager, signals};
use crate::telemetry::parsers::{self as telemetry_parsers, ParseError};
use crate::telemetry::{TelemetryPoller, TelemetryStore};

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("Serial queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Telemetry setup error: {0}")]
    Telemetry(#[from] ParseError),
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),
    #[error("Print error: {0}")]
    Print(#[from] PrintError),
    #[error("Printer link already started")]
    AlreadyStarted,
    #[error("No print in progress")]
    NoPrint,
    #[error("A print is already in progress")]
    PrintInProgress,
}

/// Owns every component and the tasks that drive them. Components receive
/// the handles they need at construction; nothing is global.
pub struct Printer {
    config: Config,
    router: Arc<OutputRouter>,
    queue: SerialQueue,
    state: Arc<StateManager>,
    telemetry: Arc<TelemetryStore>,
    poller: Mutex<Option<TelemetryPoller>>,
    info: RwLock<Option<PrinterInfo>>,
    print: tokio::sync::Mutex<Option<PrintHandle>>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Printer {
    pub fn new(config: Config, transport: Box<dyn Transport>) -> Result<Self, PrinterError> {
        let router = Arc::new(OutputRouter::new());
        let state = Arc::new(StateManager::new(config.state.clone()));
        signals::register_firmware_signals(&router, &state)?;

        let telemetry = Arc::new(TelemetryStore::new());
        telemetry_parsers::register_parsers(&router, &telemetry)?;

        let queue = SerialQueue::new(transport, router.clone(), config.queue.clone());
        let poller = TelemetryPoller::new(
            queue.clone(),
            state.clone(),
            telemetry.clone(),
            &config.telemetry,
        )?;

        Ok(Self {
            config,
            router,
            queue,
            state,
            telemetry,
            poller: Mutex::new(Some(poller)),
            info: RwLock::new(None),
            print: tokio::sync::Mutex::new(None),
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the queue loop, the queue signal bridge and the telemetry poller.
    pub fn start(&self) -> Result<(), PrinterError> {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(PrinterError::AlreadyStarted)?;

        tracing::info!("Starting printer link");
        let signals = self.queue.subscribe_signals();
        let queue_task = self.queue.spawn(self.shutdown.token())?;
        let bridge_task = signals::spawn_queue_bridge(signals, self.state.clone(), self.shutdown.token());
        let poller_task = poller.spawn(self.shutdown.token());

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([queue_task, bridge_task, poller_task]);
        Ok(())
    }

    /// Runs the identification probes and remembers the result.
    pub async fn identify(&self) -> Result<PrinterInfo, PrinterError> {
        let token = self.shutdown.token();
        let info = probes::identify(&self.queue, &token, &self.config.printer.minimum_firmware).await?;
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(info.clone());
        Ok(info)
    }

    pub fn info(&self) -> Option<PrinterInfo> {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn start_print(&self, path: &Path) -> Result<(), PrinterError> {
        let mut print = self.print.lock().await;
        if print.as_ref().is_some_and(|job| !job.is_finished()) {
            return Err(PrinterError::PrintInProgress);
        }
        let handle = print_job::start_print(
            self.queue.clone(),
            self.state.clone(),
            path,
            self.config.queue.instruction_timeout(),
            self.shutdown.token(),
        )
        .await?;
        *print = Some(handle);
        Ok(())
    }

    pub async fn pause_print(&self) -> Result<(), PrinterError> {
        self.with_print(|job| job.pause()).await
    }

    pub async fn resume_print(&self) -> Result<(), PrinterError> {
        self.with_print(|job| job.resume()).await
    }

    pub async fn stop_print(&self) -> Result<(), PrinterError> {
        self.with_print(|job| job.stop()).await
    }

    async fn with_print<F>(&self, f: F) -> Result<(), PrinterError>
    where
        F: FnOnce(&PrintHandle) -> Result<(), PrintError>,
    {
        let print = self.print.lock().await;
        let job = print
            .as_ref()
            .filter(|job| !job.is_finished())
            .ok_or(PrinterError::NoPrint)?;
        Ok(f(job)?)
    }

    /// Waits for the current print to end and returns how it went.
    pub async fn wait_print(&self) -> Result<PrintSummary, PrinterError> {
        let job = self.print.lock().await.take().ok_or(PrinterError::NoPrint)?;
        Ok(job.join().await?)
    }

    /// Acknowledges a finished job so the printer reports READY again.
    pub fn clear_job(&self) {
        self.state.handle(StateEvent::JobCleared);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<OutputRouter> {
        &self.router
    }

    pub fn queue(&self) -> &SerialQueue {
        &self.queue
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.token()
    }

    /// Signals every task to stop and waits for them.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down printer link");
        self.shutdown.trigger();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Task ended abnormally: {}", e);
            }
        }
        if let Some(job) = self.print.lock().await.take() {
            if let Err(e) = job.join().await {
                tracing::warn!("Print ended during shutdown: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Printer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Printer")
            .field("queue", &self.queue)
            .field("state", &self.state.reported_state())
            .finish_non_exhaustive()
    }
}
