//! Inbound routing and the single outbound pump.
//!
//! `route_*` methods run on the transport's task: they filter, record
//! history, lazily spawn the worker and forward envelopes. The pump is
//! one control-plane task that fans worker output back out to clients
//! and absorbs worker exits.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lucid_core::envelope::{Delivery, InboundEnvelope, OutboundEnvelope};
use lucid_core::history::HistoryEntry;
use lucid_core::ids::ConnectionId;
use lucid_telemetry::TelemetryHandle;

use crate::error::RelayError;
use crate::filter::WordFilter;
use crate::history::SessionHistoryStore;
use crate::registry::ConnectionRegistry;
use crate::supervisor::{WorkerExit, WorkerSupervisor};
use crate::worker::{ExitReason, WorkerContext};

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    supervisor: Arc<WorkerSupervisor>,
    history: Arc<SessionHistoryStore>,
    filter: WordFilter,
    telemetry: TelemetryHandle,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        supervisor: Arc<WorkerSupervisor>,
        history: Arc<SessionHistoryStore>,
        filter: WordFilter,
        telemetry: TelemetryHandle,
    ) -> Self {
        Self {
            registry,
            supervisor,
            history,
            filter,
            telemetry,
        }
    }

    pub fn filter_text(&self, text: &str) -> String {
        self.filter.filter(text)
    }

    /// Route a user message to its connection's worker, spawning one if
    /// none is live. The message is filtered and appended to the session
    /// history before forwarding, so ordering is fixed at this point.
    pub fn route_message(&self, connection_id: &ConnectionId, text: &str) -> Result<(), RelayError> {
        let filtered = self.filter.filter(text);
        self.telemetry.record("messages.in", 1, None);
        if filtered != text {
            self.telemetry.record("messages.filtered", 1, None);
        }

        self.registry.touch(connection_id);
        let meta = self
            .registry
            .meta(connection_id)
            .ok_or_else(|| RelayError::Route(connection_id.clone()))?;

        self.ensure_worker(connection_id)?;
        self.sync_if_dirty(connection_id, &meta.display_name);

        self.history
            .append(connection_id, HistoryEntry::user(filtered.clone()));

        self.supervisor
            .post_message(
                connection_id,
                InboundEnvelope::Message {
                    connection_id: connection_id.clone(),
                    display_name: meta.display_name,
                    data: filtered,
                },
            )
            .map(|_| ())
    }

    /// Replace the connection's trigger set. Applied to the registry
    /// always; forwarded to the worker only if one is live (a later spawn
    /// is seeded from the registry).
    pub fn route_triggers(&self, connection_id: &ConnectionId, triggers: Vec<String>) {
        self.registry.update_triggers(connection_id, triggers.clone());
        if self.supervisor.is_live(connection_id) {
            if let Some(meta) = self.registry.meta(connection_id) {
                let posted = self.supervisor.post_message(
                    connection_id,
                    InboundEnvelope::Triggers {
                        connection_id: connection_id.clone(),
                        display_name: meta.display_name,
                        data: triggers,
                    },
                );
                if let Ok(true) = posted {
                    self.registry.take_needs_sync(connection_id);
                }
            }
        }
    }

    /// Set or clear the collar directive. Same forwarding rules as
    /// triggers. The text is filtered: a collar must not smuggle banned
    /// words into the system prompt.
    pub fn route_collar(&self, connection_id: &ConnectionId, collar: &str) {
        let filtered = self.filter.filter(collar);
        let value = if filtered.is_empty() {
            None
        } else {
            Some(filtered.clone())
        };
        self.registry.update_collar(connection_id, value);
        if self.supervisor.is_live(connection_id) {
            if let Some(meta) = self.registry.meta(connection_id) {
                let posted = self.supervisor.post_message(
                    connection_id,
                    InboundEnvelope::Collar {
                        connection_id: connection_id.clone(),
                        display_name: meta.display_name,
                        data: filtered,
                    },
                );
                if let Ok(true) = posted {
                    self.registry.take_needs_sync(connection_id);
                }
            }
        }
    }

    /// Spawn the worker when none is live, seeded from the registry's
    /// current settings. Covers both first contact and post-crash respawn.
    fn ensure_worker(&self, connection_id: &ConnectionId) -> Result<(), RelayError> {
        if self.supervisor.is_live(connection_id) {
            return Ok(());
        }
        let meta = self
            .registry
            .meta(connection_id)
            .ok_or_else(|| RelayError::Route(connection_id.clone()))?;

        self.supervisor.spawn(
            connection_id,
            WorkerContext {
                display_name: meta.display_name,
                triggers: meta.triggers,
                collar: meta.collar,
            },
        )?;
        // The spawn snapshot already carries the latest settings.
        self.registry.take_needs_sync(connection_id);
        self.registry.set_healthy(connection_id, true);
        Ok(())
    }

    /// Push pending trigger/collar changes to a live worker before the
    /// next message, preserving FIFO order on its queue. The flag stays
    /// set until both envelopes actually fit, so a full queue retries on
    /// the next message.
    fn sync_if_dirty(&self, connection_id: &ConnectionId, display_name: &str) {
        if !self.registry.needs_sync(connection_id) {
            return;
        }
        let Some(meta) = self.registry.meta(connection_id) else {
            return;
        };
        let triggers_posted = self
            .supervisor
            .post_message(
                connection_id,
                InboundEnvelope::Triggers {
                    connection_id: connection_id.clone(),
                    display_name: display_name.to_string(),
                    data: meta.triggers,
                },
            )
            .unwrap_or(false);
        let collar_posted = self
            .supervisor
            .post_message(
                connection_id,
                InboundEnvelope::Collar {
                    connection_id: connection_id.clone(),
                    display_name: display_name.to_string(),
                    data: meta.collar.unwrap_or_default(),
                },
            )
            .unwrap_or(false);
        if triggers_posted && collar_posted {
            self.registry.take_needs_sync(connection_id);
        }
    }

    /// Start the outbound pump. Runs until both channels close.
    pub fn spawn_pump(
        self: &Arc<Self>,
        mut outbound_rx: mpsc::Receiver<OutboundEnvelope>,
        mut exit_rx: mpsc::Receiver<WorkerExit>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = outbound_rx.recv() => match envelope {
                        Some(envelope) => router.handle_outbound(envelope),
                        None => break,
                    },
                    exit = exit_rx.recv() => match exit {
                        Some(exit) => router.handle_exit(exit),
                        None => break,
                    },
                }
            }
            debug!("outbound pump stopped");
        })
    }

    fn handle_outbound(&self, envelope: OutboundEnvelope) {
        match envelope {
            OutboundEnvelope::Response {
                connection_id,
                data,
                delivery,
            } => {
                self.history
                    .append(&connection_id, HistoryEntry::assistant(data.clone()));
                self.telemetry.record("responses.out", 1, None);
                let payload = serde_json::json!({ "data": data });
                match delivery {
                    Delivery::Direct => self.registry.emit(&connection_id, "response", payload),
                    Delivery::Broadcast => self.registry.broadcast("response", payload),
                }
            }
            OutboundEnvelope::Log { connection_id, data } => {
                info!(connection_id = %connection_id, "worker: {data}");
            }
            OutboundEnvelope::Error { connection_id, data } => {
                error!(connection_id = %connection_id, "worker error: {data}");
                self.registry
                    .emit(&connection_id, "error", serde_json::json!({ "data": data }));
            }
        }
    }

    /// Absorb a worker exit. A crash marks the connection unhealthy and
    /// tells that client only; there is no automatic respawn, the next
    /// message starts a fresh worker.
    fn handle_exit(&self, exit: WorkerExit) {
        let had_handle = self
            .supervisor
            .clear_handle(&exit.connection_id, &exit.worker_id);

        match exit.reason {
            ExitReason::Crashed => {
                warn!(connection_id = %exit.connection_id, worker_id = %exit.worker_id,
                    "worker crashed");
                self.telemetry.record("workers.crashed", 1, None);
                self.registry.set_healthy(&exit.connection_id, false);
                self.registry.emit(
                    &exit.connection_id,
                    "error",
                    serde_json::json!({ "data": "assistant interrupted, send another message to continue" }),
                );
            }
            ExitReason::Idle => {
                debug!(connection_id = %exit.connection_id, "worker idled out");
            }
            reason => {
                debug!(connection_id = %exit.connection_id, reason = reason.as_str(),
                    had_handle, "worker exited");
            }
        }
    }
}
