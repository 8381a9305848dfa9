//! Orderly teardown of the whole relay, and of single connections.
//!
//! The coordinator owns the close cascade (Closing transition, worker
//! terminate, history flush, entry removal) so the transport layer and
//! the process shutdown path share one code path.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use lucid_core::ids::ConnectionId;
use lucid_core::state::ConnectionState;
use lucid_telemetry::TelemetryHandle;

use crate::history::SessionHistoryStore;
use crate::registry::ConnectionRegistry;
use crate::supervisor::WorkerSupervisor;

/// Where the process is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Terminating,
    Stopped,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Running,
            1 => Phase::Draining,
            2 => Phase::Terminating,
            _ => Phase::Stopped,
        }
    }
}

/// Outcome of a full shutdown.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShutdownReport {
    /// Connections closed cleanly within the deadline.
    pub drained: usize,
    /// Workers force-killed past the deadline.
    pub forced: usize,
}

pub struct ShutdownCoordinator {
    registry: Arc<ConnectionRegistry>,
    supervisor: Arc<WorkerSupervisor>,
    history: Arc<SessionHistoryStore>,
    grace: Duration,
    phase: AtomicU8,
    telemetry: TelemetryHandle,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        supervisor: Arc<WorkerSupervisor>,
        history: Arc<SessionHistoryStore>,
        grace: Duration,
        telemetry: TelemetryHandle,
    ) -> Self {
        Self {
            registry,
            supervisor,
            history,
            grace,
            phase: AtomicU8::new(0),
            telemetry,
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Close one connection: Closing transition, worker terminate within
    /// grace, history flush (non-fatal on failure), entry removal.
    /// Returns true when the worker had to be force-killed.
    pub async fn close_connection(&self, connection_id: &ConnectionId) -> bool {
        if let Err(e) = self.registry.transition(connection_id, ConnectionState::Closing) {
            // Already closing or gone; the cascade below is idempotent.
            tracing::debug!(connection_id = %connection_id, "close: {e}");
        }

        let forced = self
            .supervisor
            .terminate(connection_id, self.grace)
            .await
            .is_err();

        match self.history.flush_and_remove(connection_id) {
            Ok(flushed) => {
                if flushed > 0 {
                    self.telemetry.record("history.flushes", 1, None);
                }
            }
            Err(e) => {
                warn!(connection_id = %connection_id, "history flush failed: {e}");
                self.telemetry.record("history.flush_failures", 1, None);
            }
        }

        let _ = self.registry.transition(connection_id, ConnectionState::Closed);
        // Only the close that actually removed the entry counts; a repeat
        // close of a gone connection does not.
        if self.registry.remove(connection_id) {
            self.telemetry.record("connections.closed", 1, None);
        }
        forced
    }

    /// Drain everything: stop admitting, close all open connections
    /// concurrently, force-kill whatever is left past the deadline.
    pub async fn run(&self, deadline: Duration) -> ShutdownReport {
        self.set_phase(Phase::Draining);
        self.registry.set_draining();
        self.supervisor.set_draining();

        let ids = self.registry.open_ids();
        let total = ids.len();
        info!(connections = total, "shutdown: draining");

        self.set_phase(Phase::Terminating);
        let closes = ids.iter().map(|id| self.close_connection(id));
        let outcome = tokio::time::timeout(deadline, join_all(closes)).await;

        let mut forced = match outcome {
            Ok(results) => results.into_iter().filter(|forced| *forced).count(),
            Err(_) => {
                warn!("shutdown deadline elapsed with connections still open");
                0
            }
        };

        // Stragglers: anything still registered gets its worker aborted
        // and its entry dropped.
        forced += self.supervisor.abort_all();
        for id in self.registry.all_ids() {
            self.registry.remove(&id);
            forced += 1;
        }

        self.set_phase(Phase::Stopped);
        let report = ShutdownReport {
            drained: total.saturating_sub(forced),
            forced,
        };
        info!(drained = report.drained, forced = report.forced, "shutdown complete");
        report
    }
}
