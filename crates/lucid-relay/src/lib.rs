//! Per-connection worker orchestration for the chat relay: supervision,
//! routing, connection registry, session history and shutdown.

pub mod error;
pub mod filter;
pub mod history;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod supervisor;
mod worker;

pub use error::RelayError;
pub use filter::{WordFilter, FILTERED_MARKER};
pub use history::SessionHistoryStore;
pub use registry::{ClientEvent, ConnectionRegistry};
pub use router::MessageRouter;
pub use shutdown::{Phase, ShutdownCoordinator, ShutdownReport};
pub use supervisor::{WorkerExit, WorkerSupervisor};
pub use worker::{ExitReason, WorkerContext};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lucid_core::config::RelayConfig;
use lucid_llm::InferenceProvider;
use lucid_store::{Database, TranscriptRepo};
use lucid_telemetry::TelemetryHandle;

/// Depth of the shared worker-to-control-plane channel.
const OUTBOUND_DEPTH: usize = 256;
/// Depth of the exit notification channel.
const EXIT_DEPTH: usize = 64;

/// The wired-up relay: every component constructed and the outbound pump
/// running.
pub struct Relay {
    pub registry: Arc<ConnectionRegistry>,
    pub supervisor: Arc<WorkerSupervisor>,
    pub router: Arc<MessageRouter>,
    pub history: Arc<SessionHistoryStore>,
    pub coordinator: Arc<ShutdownCoordinator>,
    pump: JoinHandle<()>,
}

impl Relay {
    pub fn new(
        config: &RelayConfig,
        provider: Arc<dyn InferenceProvider>,
        db: Database,
        telemetry: TelemetryHandle,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let (exit_tx, exit_rx) = mpsc::channel(EXIT_DEPTH);

        let registry = Arc::new(ConnectionRegistry::new());
        let supervisor = Arc::new(WorkerSupervisor::new(
            provider,
            outbound_tx,
            exit_tx,
            config.worker.clone(),
            telemetry.clone(),
        ));
        let history = Arc::new(SessionHistoryStore::new(
            TranscriptRepo::new(db),
            config.history_soft_cap,
        ));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            supervisor.clone(),
            history.clone(),
            WordFilter::new(config.banned_words.clone()),
            telemetry.clone(),
        ));
        let pump = router.spawn_pump(outbound_rx, exit_rx);
        let coordinator = Arc::new(ShutdownCoordinator::new(
            registry.clone(),
            supervisor.clone(),
            history.clone(),
            config.worker.grace,
            telemetry,
        ));

        Self {
            registry,
            supervisor,
            router,
            history,
            coordinator,
            pump,
        }
    }

    /// Stop the outbound pump. Only meaningful after shutdown has drained
    /// every worker.
    pub fn stop_pump(&self) {
        self.pump.abort();
    }
}
