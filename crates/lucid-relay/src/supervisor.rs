//! Worker lifecycle: spawn, route-to, terminate, observe exits.
//!
//! One live worker per connection, enforced through the map's entry API.
//! Every worker gets a monitor task that reports exactly one exit
//! notification, whichever way the worker ends.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use lucid_core::config::WorkerConfig;
use lucid_core::envelope::{InboundEnvelope, OutboundEnvelope};
use lucid_core::ids::{ConnectionId, WorkerId};
use lucid_llm::InferenceProvider;
use lucid_telemetry::TelemetryHandle;

use crate::error::RelayError;
use crate::worker::{ExitReason, Worker, WorkerContext};

/// One worker stopped; emitted exactly once per spawn.
#[derive(Clone, Debug)]
pub struct WorkerExit {
    pub connection_id: ConnectionId,
    pub worker_id: WorkerId,
    pub reason: ExitReason,
}

struct WorkerHandle {
    worker_id: WorkerId,
    inbound: mpsc::Sender<InboundEnvelope>,
    done: watch::Receiver<bool>,
    abort: AbortHandle,
}

pub struct WorkerSupervisor {
    workers: DashMap<ConnectionId, WorkerHandle>,
    provider: Arc<dyn InferenceProvider>,
    outbound_tx: mpsc::Sender<OutboundEnvelope>,
    exit_tx: mpsc::Sender<WorkerExit>,
    config: WorkerConfig,
    /// Process-lifetime high-water mark of concurrent workers. Only ever
    /// raised, never lowered.
    listener_cap: AtomicUsize,
    draining: AtomicBool,
    /// Serializes the cap check against the insert so concurrent spawns
    /// cannot overshoot `max_workers`.
    spawn_gate: Mutex<()>,
    telemetry: TelemetryHandle,
}

impl WorkerSupervisor {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        outbound_tx: mpsc::Sender<OutboundEnvelope>,
        exit_tx: mpsc::Sender<WorkerExit>,
        config: WorkerConfig,
        telemetry: TelemetryHandle,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            provider,
            outbound_tx,
            exit_tx,
            config,
            listener_cap: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            spawn_gate: Mutex::new(()),
            telemetry,
        }
    }

    /// Spawn a worker for the connection if none is live. A no-op when one
    /// already exists.
    pub fn spawn(&self, connection_id: &ConnectionId, ctx: WorkerContext) -> Result<(), RelayError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(RelayError::Spawn("supervisor is draining".into()));
        }
        let _gate = self.spawn_gate.lock();
        if self.workers.len() >= self.config.max_workers {
            return Err(RelayError::Spawn(format!(
                "worker cap reached ({})",
                self.config.max_workers
            )));
        }

        match self.workers.entry(connection_id.clone()) {
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                let worker_id = WorkerId::new();
                let (in_tx, in_rx) = mpsc::channel(self.config.inbound_queue_depth);
                let (done_tx, done_rx) = watch::channel(false);

                let worker = Worker::new(
                    connection_id.clone(),
                    worker_id.clone(),
                    ctx,
                    self.provider.clone(),
                    self.outbound_tx.clone(),
                    self.config.idle_timeout,
                );
                let join = tokio::spawn(worker.run(in_rx, done_tx));
                let abort = join.abort_handle();

                // Monitor: exactly one exit notification per worker.
                let exit_tx = self.exit_tx.clone();
                let monitor_conn = connection_id.clone();
                let monitor_worker = worker_id.clone();
                tokio::spawn(async move {
                    let reason = match join.await {
                        Ok(reason) => reason,
                        Err(e) if e.is_cancelled() => ExitReason::Killed,
                        Err(_) => ExitReason::Crashed,
                    };
                    let _ = exit_tx
                        .send(WorkerExit {
                            connection_id: monitor_conn,
                            worker_id: monitor_worker,
                            reason,
                        })
                        .await;
                });

                slot.insert(WorkerHandle {
                    worker_id: worker_id.clone(),
                    inbound: in_tx,
                    done: done_rx,
                    abort,
                });

                let live = self.workers.len();
                self.listener_cap.fetch_max(live, Ordering::SeqCst);
                self.telemetry.record("workers.spawned", 1, None);
                info!(connection_id = %connection_id, worker_id = %worker_id, live, "worker spawned");
                Ok(())
            }
        }
    }

    /// Forward an envelope to the connection's worker. Non-blocking: a
    /// full queue drops the envelope (logged, counted); a missing worker
    /// is a route error the caller decides how to handle. Returns whether
    /// the envelope was actually enqueued so callers can retry later.
    pub fn post_message(
        &self,
        connection_id: &ConnectionId,
        envelope: InboundEnvelope,
    ) -> Result<bool, RelayError> {
        let handle = self
            .workers
            .get(connection_id)
            .ok_or_else(|| RelayError::Route(connection_id.clone()))?;

        match handle.inbound.try_send(envelope) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %connection_id, "worker queue full, envelope dropped");
                self.telemetry.record("routes.dropped", 1, None);
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                // Worker already exited; its handle just hasn't been
                // cleared yet. Not a backpressure drop.
                debug!(connection_id = %connection_id, "worker inbound closed, envelope not delivered");
                Ok(false)
            }
        }
    }

    /// Ask the worker to exit, waiting up to `grace` before force-killing.
    /// Idempotent: no live worker means nothing to do.
    pub async fn terminate(
        &self,
        connection_id: &ConnectionId,
        grace: Duration,
    ) -> Result<(), RelayError> {
        // Remove the handle first: once terminate starts, any exit for
        // this worker is an expected one.
        let Some((_, handle)) = self.workers.remove(connection_id) else {
            return Ok(());
        };

        let _ = handle.inbound.try_send(InboundEnvelope::Terminate {
            connection_id: connection_id.clone(),
        });

        let mut done = handle.done.clone();
        let finished = tokio::time::timeout(grace, async {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    // Worker task is gone either way.
                    break;
                }
            }
        })
        .await
        .is_ok();

        if finished {
            debug!(connection_id = %connection_id, "worker exited within grace");
            Ok(())
        } else {
            handle.abort.abort();
            self.telemetry.record("workers.killed", 1, None);
            warn!(connection_id = %connection_id, "worker missed grace deadline, killed");
            Err(RelayError::ShutdownTimeout(connection_id.clone()))
        }
    }

    /// Drop the tracked handle after an exit notification, but only if it
    /// still refers to the worker that exited (a fresh respawn must not be
    /// clobbered). Returns whether a handle was present.
    pub fn clear_handle(&self, connection_id: &ConnectionId, worker_id: &WorkerId) -> bool {
        self.workers
            .remove_if(connection_id, |_, handle| handle.worker_id == *worker_id)
            .is_some()
    }

    pub fn is_live(&self, connection_id: &ConnectionId) -> bool {
        self.workers.contains_key(connection_id)
    }

    pub fn live_count(&self) -> usize {
        self.workers.len()
    }

    /// High-water mark of concurrent workers for this process.
    pub fn listener_cap(&self) -> usize {
        self.listener_cap.load(Ordering::SeqCst)
    }

    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Force-kill every remaining worker. Shutdown straggler path.
    pub fn abort_all(&self) -> usize {
        let mut killed = 0;
        let ids: Vec<ConnectionId> = self.workers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.workers.remove(&id) {
                handle.abort.abort();
                killed += 1;
            }
        }
        if killed > 0 {
            self.telemetry.record("workers.killed", killed as u64, None);
        }
        killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lucid_llm::{MockProvider, MockReply};
    use lucid_telemetry::TelemetryRecorder;

    struct Rig {
        supervisor: Arc<WorkerSupervisor>,
        outbound_rx: mpsc::Receiver<OutboundEnvelope>,
        exit_rx: mpsc::Receiver<WorkerExit>,
    }

    fn rig_with(provider: Arc<MockProvider>, config: WorkerConfig) -> Rig {
        let (out_tx, outbound_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = mpsc::channel(16);
        let (telemetry, _join) = TelemetryRecorder::spawn_in_memory().unwrap();
        let supervisor = Arc::new(WorkerSupervisor::new(
            provider, out_tx, exit_tx, config, telemetry,
        ));
        Rig {
            supervisor,
            outbound_rx,
            exit_rx,
        }
    }

    fn rig(replies: Vec<MockReply>) -> Rig {
        rig_with(Arc::new(MockProvider::new(replies)), WorkerConfig::default())
    }

    fn conn(s: &str) -> ConnectionId {
        ConnectionId::from_raw(s)
    }

    fn message(id: &ConnectionId, data: &str) -> InboundEnvelope {
        InboundEnvelope::Message {
            connection_id: id.clone(),
            display_name: "luna".into(),
            data: data.into(),
        }
    }

    #[tokio::test]
    async fn spawn_is_idempotent_per_connection() {
        let rig = rig(vec![]);
        let id = conn("conn_a");

        rig.supervisor.spawn(&id, WorkerContext::default()).unwrap();
        rig.supervisor.spawn(&id, WorkerContext::default()).unwrap();

        assert_eq!(rig.supervisor.live_count(), 1);
    }

    #[tokio::test]
    async fn spawn_rejected_when_draining() {
        let rig = rig(vec![]);
        rig.supervisor.set_draining();
        let result = rig.supervisor.spawn(&conn("conn_a"), WorkerContext::default());
        assert!(matches!(result, Err(RelayError::Spawn(_))));
    }

    #[tokio::test]
    async fn spawn_rejected_at_worker_cap() {
        let config = WorkerConfig {
            max_workers: 1,
            ..Default::default()
        };
        let rig = rig_with(Arc::new(MockProvider::new(vec![])), config);

        rig.supervisor.spawn(&conn("conn_a"), WorkerContext::default()).unwrap();
        let result = rig.supervisor.spawn(&conn("conn_b"), WorkerContext::default());
        assert!(matches!(result, Err(RelayError::Spawn(_))));
    }

    #[tokio::test]
    async fn listener_cap_is_monotone() {
        let mut rig = rig(vec![]);
        let a = conn("conn_a");
        let b = conn("conn_b");

        rig.supervisor.spawn(&a, WorkerContext::default()).unwrap();
        rig.supervisor.spawn(&b, WorkerContext::default()).unwrap();
        assert_eq!(rig.supervisor.listener_cap(), 2);

        rig.supervisor.terminate(&a, Duration::from_millis(500)).await.unwrap();
        rig.exit_rx.recv().await.unwrap();
        assert_eq!(rig.supervisor.live_count(), 1);

        // Cap stays at the high-water mark after a worker leaves.
        assert_eq!(rig.supervisor.listener_cap(), 2);

        rig.supervisor.spawn(&a, WorkerContext::default()).unwrap();
        assert_eq!(rig.supervisor.listener_cap(), 2);
    }

    #[tokio::test]
    async fn post_message_reaches_worker() {
        let mut rig = rig(vec![MockReply::text("pong")]);
        let id = conn("conn_a");
        rig.supervisor.spawn(&id, WorkerContext::default()).unwrap();

        rig.supervisor.post_message(&id, message(&id, "ping")).unwrap();

        match rig.outbound_rx.recv().await.unwrap() {
            OutboundEnvelope::Response { data, .. } => assert_eq!(data, "pong"),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_queue_reports_not_enqueued() {
        let config = WorkerConfig {
            inbound_queue_depth: 1,
            ..Default::default()
        };
        let rig = rig_with(Arc::new(MockProvider::new(vec![])), config);
        let id = conn("conn_a");
        rig.supervisor.spawn(&id, WorkerContext::default()).unwrap();

        // No await between posts: the worker never gets to drain.
        assert!(rig.supervisor.post_message(&id, message(&id, "fits")).unwrap());
        assert!(!rig.supervisor.post_message(&id, message(&id, "overflow")).unwrap());
    }

    #[tokio::test]
    async fn post_message_without_worker_is_route_error() {
        let rig = rig(vec![]);
        let id = conn("conn_a");
        let result = rig.supervisor.post_message(&id, message(&id, "x"));
        assert!(matches!(result, Err(RelayError::Route(_))));
    }

    #[tokio::test]
    async fn terminate_yields_single_exit_notification() {
        let mut rig = rig(vec![]);
        let id = conn("conn_a");
        rig.supervisor.spawn(&id, WorkerContext::default()).unwrap();

        rig.supervisor.terminate(&id, Duration::from_millis(500)).await.unwrap();
        assert!(!rig.supervisor.is_live(&id));

        let exit = rig.exit_rx.recv().await.unwrap();
        assert_eq!(exit.reason, ExitReason::Terminated);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rig.exit_rx.recv())
                .await
                .is_err(),
            "no second exit notification"
        );
    }

    #[tokio::test]
    async fn terminate_without_worker_is_ok() {
        let rig = rig(vec![]);
        rig.supervisor
            .terminate(&conn("conn_a"), Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stuck_worker_killed_past_grace() {
        // A long in-flight completion ignores the terminate envelope.
        let mut rig = rig(vec![MockReply::delayed(
            Duration::from_secs(300),
            MockReply::text("never"),
        )]);
        let id = conn("conn_a");
        rig.supervisor.spawn(&id, WorkerContext::default()).unwrap();
        rig.supervisor.post_message(&id, message(&id, "slow")).unwrap();
        tokio::task::yield_now().await;

        let result = rig
            .supervisor
            .terminate(&id, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RelayError::ShutdownTimeout(_))));

        let exit = rig.exit_rx.recv().await.unwrap();
        assert_eq!(exit.reason, ExitReason::Killed);
    }

    #[tokio::test]
    async fn crash_reported_as_crashed() {
        struct PanicProvider;

        #[async_trait::async_trait]
        impl InferenceProvider for PanicProvider {
            fn name(&self) -> &str {
                "panic"
            }
            async fn list_models(
                &self,
            ) -> Result<Vec<String>, lucid_core::errors::InferenceError> {
                Ok(vec![])
            }
            async fn complete(
                &self,
                _entries: &[lucid_core::history::HistoryEntry],
            ) -> Result<String, lucid_core::errors::InferenceError> {
                panic!("backend blew up");
            }
        }

        let (out_tx, _out_rx) = mpsc::channel(16);
        let (exit_tx, mut exit_rx) = mpsc::channel(16);
        let (telemetry, _join) = TelemetryRecorder::spawn_in_memory().unwrap();
        let supervisor = WorkerSupervisor::new(
            Arc::new(PanicProvider),
            out_tx,
            exit_tx,
            WorkerConfig::default(),
            telemetry.clone(),
        );

        let id = conn("conn_a");
        supervisor.spawn(&id, WorkerContext::default()).unwrap();
        supervisor.post_message(&id, message(&id, "boom")).unwrap();

        let exit = exit_rx.recv().await.unwrap();
        assert_eq!(exit.reason, ExitReason::Crashed);

        // The inbound channel is closed but the handle lingers until
        // cleared; a post in that window is not enqueued and is not a
        // backpressure drop.
        assert!(!supervisor.post_message(&id, message(&id, "late")).unwrap());
        assert_eq!(telemetry.counter_get("routes.dropped"), 0);

        // Handle for the dead worker is still present until cleared; a
        // matching clear removes it, a stale one does not.
        assert!(supervisor.clear_handle(&id, &exit.worker_id));
        assert!(!supervisor.clear_handle(&id, &exit.worker_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_cap_holds_under_concurrent_spawns() {
        let config = WorkerConfig {
            max_workers: 4,
            ..Default::default()
        };
        let rig = rig_with(Arc::new(MockProvider::new(vec![])), config);

        let mut attempts = Vec::new();
        for i in 0..16 {
            let supervisor = rig.supervisor.clone();
            let id = conn(&format!("conn_{i}"));
            attempts.push(tokio::spawn(async move {
                supervisor.spawn(&id, WorkerContext::default()).is_ok()
            }));
        }
        let mut spawned = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                spawned += 1;
            }
        }

        assert_eq!(spawned, 4);
        assert_eq!(rig.supervisor.live_count(), 4);
    }

    #[tokio::test]
    async fn clear_handle_spares_respawned_worker() {
        let rig = rig(vec![]);
        let id = conn("conn_a");
        rig.supervisor.spawn(&id, WorkerContext::default()).unwrap();

        // A clear for some other worker id must not remove the live one.
        let stale = WorkerId::new();
        assert!(!rig.supervisor.clear_handle(&id, &stale));
        assert!(rig.supervisor.is_live(&id));
    }

    #[tokio::test]
    async fn abort_all_kills_stragglers() {
        let mut rig = rig(vec![]);
        rig.supervisor.spawn(&conn("conn_a"), WorkerContext::default()).unwrap();
        rig.supervisor.spawn(&conn("conn_b"), WorkerContext::default()).unwrap();

        assert_eq!(rig.supervisor.abort_all(), 2);
        assert_eq!(rig.supervisor.live_count(), 0);

        // Both monitors still report exactly one exit each.
        let first = rig.exit_rx.recv().await.unwrap();
        let second = rig.exit_rx.recv().await.unwrap();
        assert_eq!(first.reason, ExitReason::Killed);
        assert_eq!(second.reason, ExitReason::Killed);
    }
}
