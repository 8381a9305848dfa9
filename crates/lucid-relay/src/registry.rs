//! Connection bookkeeping: identity, lifecycle state, persona settings
//! and the outbound event channel for each live client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use lucid_core::ids::ConnectionId;
use lucid_core::state::ConnectionState;

use crate::error::RelayError;

/// A frame pushed to a client over its transport.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

impl ClientEvent {
    pub fn new(event: &str, payload: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            payload,
        }
    }
}

/// Persona settings snapshot used to seed a worker.
#[derive(Clone, Debug)]
pub struct ConnectionMeta {
    pub display_name: String,
    pub triggers: Vec<String>,
    pub collar: Option<String>,
    pub state: ConnectionState,
    pub healthy: bool,
}

struct Connection {
    display_name: String,
    state: ConnectionState,
    triggers: Vec<String>,
    collar: Option<String>,
    healthy: bool,
    /// Worker-visible settings changed since the live worker last saw them.
    needs_sync: bool,
    last_activity: Instant,
    outbound: mpsc::Sender<ClientEvent>,
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    draining: AtomicBool,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            draining: AtomicBool::new(false),
        }
    }

    /// Admit a new connection in `Connecting`. Rejected while draining.
    pub fn register(
        &self,
        id: ConnectionId,
        display_name: Option<String>,
        outbound: mpsc::Sender<ClientEvent>,
    ) -> Result<(), RelayError> {
        if self.is_draining() {
            return Err(RelayError::Spawn("not accepting connections: draining".into()));
        }
        self.connections.insert(
            id,
            Connection {
                display_name: display_name.unwrap_or_else(|| "anonymous".to_string()),
                state: ConnectionState::Connecting,
                triggers: Vec::new(),
                collar: None,
                healthy: true,
                needs_sync: false,
                last_activity: Instant::now(),
                outbound,
            },
        );
        Ok(())
    }

    /// Enforce the lifecycle machine. Illegal transitions have no side
    /// effects.
    pub fn transition(&self, id: &ConnectionId, next: ConnectionState) -> Result<(), RelayError> {
        let mut conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| RelayError::Route(id.clone()))?;
        if !conn.state.can_transition_to(next) {
            return Err(RelayError::State {
                from: conn.state,
                to: next,
            });
        }
        conn.state = next;
        Ok(())
    }

    pub fn state_of(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.connections.get(id).map(|c| c.state)
    }

    pub fn meta(&self, id: &ConnectionId) -> Option<ConnectionMeta> {
        self.connections.get(id).map(|c| ConnectionMeta {
            display_name: c.display_name.clone(),
            triggers: c.triggers.clone(),
            collar: c.collar.clone(),
            state: c.state,
            healthy: c.healthy,
        })
    }

    pub fn update_triggers(&self, id: &ConnectionId, triggers: Vec<String>) {
        if let Some(mut c) = self.connections.get_mut(id) {
            c.triggers = triggers;
            c.needs_sync = true;
            c.last_activity = Instant::now();
        }
    }

    pub fn update_collar(&self, id: &ConnectionId, collar: Option<String>) {
        if let Some(mut c) = self.connections.get_mut(id) {
            c.collar = collar;
            c.needs_sync = true;
            c.last_activity = Instant::now();
        }
    }

    pub fn update_display_name(&self, id: &ConnectionId, name: String) {
        if let Some(mut c) = self.connections.get_mut(id) {
            c.display_name = name;
            c.needs_sync = true;
            c.last_activity = Instant::now();
        }
    }

    pub fn touch(&self, id: &ConnectionId) {
        if let Some(mut c) = self.connections.get_mut(id) {
            c.last_activity = Instant::now();
        }
    }

    pub fn set_healthy(&self, id: &ConnectionId, healthy: bool) {
        if let Some(mut c) = self.connections.get_mut(id) {
            c.healthy = healthy;
        }
    }

    /// Whether worker-visible settings changed since the last sync.
    pub fn needs_sync(&self, id: &ConnectionId) -> bool {
        self.connections.get(id).map(|c| c.needs_sync).unwrap_or(false)
    }

    /// Read and clear the sync flag in one step.
    pub fn take_needs_sync(&self, id: &ConnectionId) -> bool {
        self.connections
            .get_mut(id)
            .map(|mut c| std::mem::take(&mut c.needs_sync))
            .unwrap_or(false)
    }

    /// Push an event to one connection. Non-blocking: frames to a slow
    /// client are dropped and logged rather than stalling the control
    /// plane.
    pub fn emit(&self, id: &ConnectionId, event: &str, payload: serde_json::Value) {
        if let Some(c) = self.connections.get(id) {
            if c.outbound.try_send(ClientEvent::new(event, payload)).is_err() {
                debug!(connection_id = %id, event, "client send queue full, frame dropped");
            }
        }
    }

    /// Push an event to every connection matching the predicate.
    pub fn broadcast_filtered<F>(&self, predicate: F, event: &str, payload: serde_json::Value)
    where
        F: Fn(&ConnectionId) -> bool,
    {
        for entry in self.connections.iter() {
            if !predicate(entry.key()) {
                continue;
            }
            if entry
                .value()
                .outbound
                .try_send(ClientEvent::new(event, payload.clone()))
                .is_err()
            {
                debug!(connection_id = %entry.key(), event, "client send queue full, frame dropped");
            }
        }
    }

    pub fn broadcast(&self, event: &str, payload: serde_json::Value) {
        self.broadcast_filtered(|_| true, event, payload);
    }

    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn all_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Connections not yet in a closing state, for the drain snapshot.
    pub fn open_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|e| {
                matches!(
                    e.value().state,
                    ConnectionState::Connecting | ConnectionState::Active
                )
            })
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}
