//! The per-connection worker: a FIFO loop that owns its conversation
//! context and talks to the inference backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use lucid_core::envelope::{Delivery, InboundEnvelope, OutboundEnvelope};
use lucid_core::history::HistoryEntry;
use lucid_core::ids::{ConnectionId, WorkerId};
use lucid_llm::InferenceProvider;

/// Sent to the user when the backend fails; the session itself survives.
const FALLBACK_RESPONSE: &str =
    "I'm sorry, I lost my train of thought for a moment. Tell me that again?";

/// Why a worker stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Inbound channel closed; nothing left to do.
    Finished,
    /// No traffic within the idle budget; exited voluntarily.
    Idle,
    /// Honored a terminate request.
    Terminated,
    /// Force-aborted past the grace deadline.
    Killed,
    /// The task panicked.
    Crashed,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::Finished => "finished",
            ExitReason::Idle => "idle",
            ExitReason::Terminated => "terminated",
            ExitReason::Killed => "killed",
            ExitReason::Crashed => "crashed",
        }
    }
}

/// Settings a worker starts from, snapshotted at spawn time.
#[derive(Clone, Debug, Default)]
pub struct WorkerContext {
    pub display_name: String,
    pub triggers: Vec<String>,
    pub collar: Option<String>,
}

pub(crate) struct Worker {
    connection_id: ConnectionId,
    worker_id: WorkerId,
    display_name: String,
    triggers: Vec<String>,
    collar: Option<String>,
    /// Local conversation: slot 0 is the system prompt, rebuilt per turn.
    context: Vec<HistoryEntry>,
    provider: Arc<dyn InferenceProvider>,
    outbound: mpsc::Sender<OutboundEnvelope>,
    idle_timeout: Duration,
}

impl Worker {
    pub(crate) fn new(
        connection_id: ConnectionId,
        worker_id: WorkerId,
        ctx: WorkerContext,
        provider: Arc<dyn InferenceProvider>,
        outbound: mpsc::Sender<OutboundEnvelope>,
        idle_timeout: Duration,
    ) -> Self {
        let mut worker = Self {
            connection_id,
            worker_id,
            display_name: ctx.display_name,
            triggers: ctx.triggers,
            collar: ctx.collar,
            context: Vec::new(),
            provider,
            outbound,
            idle_timeout,
        };
        worker.context.push(HistoryEntry::system(worker.system_prompt()));
        worker
    }

    /// The collar, when set, replaces the default persona entirely.
    fn system_prompt(&self) -> String {
        if let Some(collar) = &self.collar {
            return collar.clone();
        }
        let triggers = if self.triggers.is_empty() {
            "none".to_string()
        } else {
            self.triggers.join(", ")
        };
        format!(
            "You are a gentle, soothing companion speaking with {}. \
             Active triggers: {}. Weave any active triggers naturally into \
             your replies. Keep responses short, calm and affectionate.",
            self.display_name, triggers
        )
    }

    fn refresh_system_prompt(&mut self) {
        self.context[0] = HistoryEntry::system(self.system_prompt());
    }

    pub(crate) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundEnvelope>,
        done: watch::Sender<bool>,
    ) -> ExitReason {
        loop {
            let envelope = match tokio::time::timeout(self.idle_timeout, inbound.recv()).await {
                Err(_) => {
                    debug!(connection_id = %self.connection_id, worker_id = %self.worker_id,
                        "idle timeout, worker exiting");
                    let _ = done.send(true);
                    return ExitReason::Idle;
                }
                Ok(None) => {
                    let _ = done.send(true);
                    return ExitReason::Finished;
                }
                Ok(Some(envelope)) => envelope,
            };

            match envelope {
                InboundEnvelope::Message {
                    display_name, data, ..
                } => {
                    self.display_name = display_name;
                    self.handle_message(data).await;
                }
                InboundEnvelope::Triggers { data, .. } => {
                    self.triggers = data;
                }
                InboundEnvelope::Collar { data, .. } => {
                    self.collar = if data.trim().is_empty() {
                        None
                    } else {
                        Some(data)
                    };
                }
                InboundEnvelope::Terminate { .. } => {
                    let _ = done.send(true);
                    return ExitReason::Terminated;
                }
            }
        }
    }

    async fn handle_message(&mut self, data: String) {
        self.refresh_system_prompt();
        self.context.push(HistoryEntry::user(data));

        let reply = match self.provider.complete(&self.context).await {
            Ok(text) => text,
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, kind = e.error_kind(),
                    "inference failed, sending fallback");
                FALLBACK_RESPONSE.to_string()
            }
        };

        self.context.push(HistoryEntry::assistant(reply.clone()));
        let envelope = OutboundEnvelope::Response {
            connection_id: self.connection_id.clone(),
            data: reply,
            delivery: Delivery::Direct,
        };
        if self.outbound.send(envelope).await.is_err() {
            debug!(connection_id = %self.connection_id, "control plane gone, response dropped");
        }
    }
}
