//! Test harness wiring a connector kernel to recording collaborators.
//!
//! Every test gets a fresh kernel on in-memory stores, a manual clock and
//! retry delays of zero, so the state machines can be stepped round by round
//! without sleeping.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use connector_core::kernel::test_dependencies::{
    MemoryPublisher, RecordingDispatcher, ScriptedProvisioner,
};
use connector_core::kernel::{ConnectorDeps, ConnectorKernel};
use connector_core::Config;
use statemachine::testing::ManualClock;
use statemachine::RoundReport;
use test_context::AsyncTestContext;

/// Upper bound on rounds per [`TestHarness::step`].
const MAX_ROUNDS: usize = 50;

/// Test harness that owns one connector instance.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     ctx.kernel.negotiations.initiate(request).await.unwrap();
///     ctx.step().await;
/// }
/// ```
pub struct TestHarness {
    pub config: Config,
    pub clock: Arc<ManualClock>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub provisioner: Arc<ScriptedProvisioner>,
    pub publisher: Arc<MemoryPublisher>,
    pub kernel: ConnectorKernel,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().expect("Failed to create test harness")
    }
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let config = Self::test_config(&[])?;
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let provisioner = Arc::new(ScriptedProvisioner::new());
        let publisher = Arc::new(MemoryPublisher::new());

        let deps = ConnectorDeps::new(
            dispatcher.clone(),
            provisioner.clone(),
            publisher.clone(),
            clock.clone(),
        );
        let kernel =
            ConnectorKernel::in_memory(&config, &deps).context("Failed to build kernel")?;

        Ok(Self {
            config,
            clock,
            dispatcher,
            provisioner,
            publisher,
            kernel,
        })
    }

    /// Test configuration with immediate retries, plus `overrides`.
    pub fn test_config(overrides: &[(&str, &str)]) -> Result<Config> {
        let mut vars: HashMap<String, String> = [
            ("CONNECTOR_RUNTIME_ID", "connector-test"),
            ("STATE_MACHINE_BATCH_SIZE", "10"),
            ("STATE_MACHINE_ITERATION_WAIT_MS", "10"),
            ("STATE_MACHINE_MAX_WAIT_MS", "100"),
            ("STATE_MACHINE_SHUTDOWN_TIMEOUT_MS", "1000"),
            ("SEND_RETRY_LIMIT", "3"),
            ("SEND_RETRY_BASE_DELAY_MS", "0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in overrides {
            vars.insert(k.to_string(), v.to_string());
        }
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    /// Collaborators of this harness, for building extra managers.
    pub fn deps(&self) -> ConnectorDeps {
        ConnectorDeps::new(
            self.dispatcher.clone(),
            self.provisioner.clone(),
            self.publisher.clone(),
            self.clock.clone(),
        )
    }

    /// Run rounds until one makes no progress.
    pub async fn step(&self) -> RoundReport {
        let mut total = RoundReport::default();
        for _ in 0..MAX_ROUNDS {
            let report = self.kernel.run_round().await;
            total.merge(report);
            if !report.is_productive() {
                break;
            }
        }
        self.settle().await;
        total
    }

    /// Let spawned after-save listeners finish.
    pub async fn settle(&self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }
}
