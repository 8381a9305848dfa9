//! Typed message envelopes exchanged between the control plane and workers.
//!
//! Both directions are closed tagged unions, decoded once at the boundary —
//! workers and the control plane never exchange loosely typed values.

use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;

/// Control plane → worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundEnvelope {
    /// A user message to run through the inference backend.
    #[serde(rename_all = "camelCase")]
    Message {
        connection_id: ConnectionId,
        display_name: String,
        data: String,
    },
    /// Replace the worker's active trigger set.
    #[serde(rename_all = "camelCase")]
    Triggers {
        connection_id: ConnectionId,
        display_name: String,
        data: Vec<String>,
    },
    /// Set the collar directive, overriding the default persona.
    #[serde(rename_all = "camelCase")]
    Collar {
        connection_id: ConnectionId,
        display_name: String,
        data: String,
    },
    /// Ask the worker to flush pending state and exit voluntarily.
    #[serde(rename_all = "camelCase")]
    Terminate { connection_id: ConnectionId },
}

impl InboundEnvelope {
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            InboundEnvelope::Message { connection_id, .. }
            | InboundEnvelope::Triggers { connection_id, .. }
            | InboundEnvelope::Collar { connection_id, .. }
            | InboundEnvelope::Terminate { connection_id } => connection_id,
        }
    }

    /// Tag string as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEnvelope::Message { .. } => "message",
            InboundEnvelope::Triggers { .. } => "triggers",
            InboundEnvelope::Collar { .. } => "collar",
            InboundEnvelope::Terminate { .. } => "terminate",
        }
    }
}

/// How a worker response should be delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Only the originating connection receives the response.
    #[default]
    Direct,
    /// Every live connection receives the response.
    Broadcast,
}

/// Worker → control plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundEnvelope {
    #[serde(rename_all = "camelCase")]
    Response {
        connection_id: ConnectionId,
        data: String,
        #[serde(default)]
        delivery: Delivery,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        connection_id: ConnectionId,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        connection_id: ConnectionId,
        data: String,
    },
}

impl OutboundEnvelope {
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            OutboundEnvelope::Response { connection_id, .. }
            | OutboundEnvelope::Log { connection_id, .. }
            | OutboundEnvelope::Error { connection_id, .. } => connection_id,
        }
    }
}
