//! The processing loop.
//!
//! A [`StateMachineManager`] owns one worker task. Each iteration of that task
//! is a *round*:
//!
//! ```text
//! loop {
//!     commands.run_round()          drain queued commands
//!     for p in processors { p.run_round() }
//!     if nothing processed { sleep(wait.retry_in_millis()) }   cancellable
//!     else                 { wait.success() }                  no sleep
//! }
//! ```
//!
//! Rounds are isolated: an error or panic from one processor is logged and the
//! remaining processors still run. Nothing a processor does terminates the
//! loop; only [`StateMachineManager::stop`] does.
//!
//! # Lifecycle
//!
//! `Stopped → Starting → Running → Stopping → Stopped`
//!
//! `stop()` never interrupts an in-flight round. It cancels the loop, which
//! exits at its next check, and waits up to the configured shutdown timeout.
//!
//! Managers never share a lease namespace; give each one its own store (and
//! holder id) per entity type.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::error::EngineError;
use crate::processor::{ProcessRound, RoundReport};
use crate::wait::WaitStrategy;

/// Lifecycle state of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ManagerState {
    fn as_u8(self) -> u8 {
        match self {
            ManagerState::Stopped => 0,
            ManagerState::Starting => 1,
            ManagerState::Running => 2,
            ManagerState::Stopping => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ManagerState::Starting,
            2 => ManagerState::Running,
            3 => ManagerState::Stopping,
            _ => ManagerState::Stopped,
        }
    }
}

/// Configuration for a manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name used in logs and errors.
    pub name: String,
    /// How long `stop()` waits for the loop to exit.
    pub shutdown_timeout: Duration,
}

impl ManagerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidConfig("manager name must not be empty".into()));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(format!(
                "manager {} needs a non-zero shutdown timeout",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "state-machine".into(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Runs one pass over every registered round.
async fn run_rounds(name: &str, rounds: &[Arc<dyn ProcessRound>]) -> RoundReport {
    let mut total = RoundReport::default();

    for round in rounds {
        let outcome = AssertUnwindSafe(round.run_round()).catch_unwind().await;
        match outcome {
            Ok(Ok(report)) => total.merge(report),
            Ok(Err(e)) => {
                error!(manager = %name, processor = %round.name(), error = %e, "processor round failed");
                total.failed += 1;
            }
            Err(payload) => {
                let e = EngineError::from_panic(format!("processor {}", round.name()), payload);
                error!(manager = %name, processor = %round.name(), error = %e, "processor round panicked");
                total.failed += 1;
            }
        }
    }

    total
}

async fn run_loop(
    name: String,
    rounds: Vec<Arc<dyn ProcessRound>>,
    wait: Arc<dyn WaitStrategy>,
    shutdown: CancellationToken,
) {
    info!(manager = %name, rounds = rounds.len(), "state machine manager running");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let report = run_rounds(&name, &rounds).await;

        if report.is_productive() {
            trace!(manager = %name, processed = report.processed, failed = report.failed, "productive round");
            wait.success();
            // stay responsive to cancellation between busy rounds
            tokio::task::yield_now().await;
            continue;
        }

        let delay = wait.retry_in_millis();
        trace!(manager = %name, delay_ms = delay, "idle round");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        }
    }

    debug!(manager = %name, "processing loop exited");
}

struct Worker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives a set of processors (and optionally a command runner) on one task.
pub struct StateMachineManager {
    name: String,
    commands: Option<Arc<dyn ProcessRound>>,
    processors: Vec<Arc<dyn ProcessRound>>,
    wait: Arc<dyn WaitStrategy>,
    shutdown_timeout: Duration,
    state: AtomicU8,
    worker: Mutex<Option<Worker>>,
}

impl StateMachineManager {
    pub fn new(config: ManagerConfig, wait: Arc<dyn WaitStrategy>) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            name: config.name,
            commands: None,
            processors: Vec::new(),
            wait,
            shutdown_timeout: config.shutdown_timeout,
            state: AtomicU8::new(ManagerState::Stopped.as_u8()),
            worker: Mutex::new(None),
        })
    }

    /// Add a processor; processors run in registration order.
    pub fn with_processor<P: ProcessRound>(mut self, processor: P) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Drain this command runner at the start of every round.
    pub fn with_commands<R: ProcessRound>(mut self, runner: R) -> Self {
        self.commands = Some(Arc::new(runner));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    fn set_state(&self, state: ManagerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: ManagerState, to: ManagerState) -> Result<(), EngineError> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| EngineError::InvalidManagerState {
                name: self.name.clone(),
                expected: from,
                actual: ManagerState::from_u8(actual),
            })
    }

    /// Commands first, then processors in registration order.
    fn rounds(&self) -> Vec<Arc<dyn ProcessRound>> {
        self.commands
            .iter()
            .chain(self.processors.iter())
            .cloned()
            .collect()
    }

    /// Run a single round on the caller's task.
    ///
    /// The loop runs exactly this; tests use it to step the engine
    /// deterministically without starting the worker.
    pub async fn run_round(&self) -> RoundReport {
        run_rounds(&self.name, &self.rounds()).await
    }

    /// Spawn the processing loop.
    ///
    /// Refused while a loop whose stop timed out is still finishing its
    /// round, so one manager never runs two rounds at once.
    pub fn start(&self) -> Result<(), EngineError> {
        self.transition(ManagerState::Stopped, ManagerState::Starting)?;

        let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            self.set_state(ManagerState::Stopped);
            return Err(EngineError::LoopStillRunning {
                name: self.name.clone(),
            });
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.name.clone(),
            self.rounds(),
            Arc::clone(&self.wait),
            shutdown.clone(),
        ));

        *slot = Some(Worker { shutdown, handle });
        drop(slot);
        self.set_state(ManagerState::Running);
        info!(manager = %self.name, "state machine manager started");
        Ok(())
    }

    /// Signal the loop to exit after the current round and wait for it.
    ///
    /// Stopping a stopped manager is a no-op. If the loop does not exit
    /// within the shutdown timeout the manager is still marked stopped and
    /// the task is left to finish on its own; [`Self::start`] is refused
    /// until it has.
    pub async fn stop(&self) -> Result<(), EngineError> {
        if self.state() == ManagerState::Stopped {
            debug!(manager = %self.name, "stop called on stopped manager");
            return Ok(());
        }
        self.transition(ManagerState::Running, ManagerState::Stopping)?;

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut worker) = worker else {
            self.set_state(ManagerState::Stopped);
            return Ok(());
        };

        info!(manager = %self.name, "stopping state machine manager");
        worker.shutdown.cancel();

        let result = match tokio::time::timeout(self.shutdown_timeout, &mut worker.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(manager = %self.name, error = %e, "processing loop terminated abnormally");
                Ok(())
            }
            Err(_) => {
                let err = EngineError::ShutdownTimeout {
                    name: self.name.clone(),
                    timeout: self.shutdown_timeout,
                };
                error!(manager = %self.name, error = %err, "shutdown timed out");
                *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
                Err(err)
            }
        };

        self.set_state(ManagerState::Stopped);
        if result.is_ok() {
            info!(manager = %self.name, "state machine manager stopped");
        }
        result
    }
}

impl Drop for StateMachineManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().ok().and_then(Option::take) {
            worker.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for StateMachineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineManager")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("processors", &self.processors.len())
            .field("commands", &self.commands.is_some())
            .finish()
    }
}
