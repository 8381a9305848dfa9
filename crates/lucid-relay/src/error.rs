use lucid_core::errors::InferenceError;
use lucid_core::ids::ConnectionId;
use lucid_core::state::ConnectionState;
use lucid_store::StoreError;

/// Error taxonomy for the relay control plane. Every variant is scoped to
/// one connection; recovery never crosses connections.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("worker spawn failed: {0}")]
    Spawn(String),

    #[error("no route to connection {0}")]
    Route(ConnectionId),

    #[error("illegal state transition: {from} -> {to}")]
    State {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("history flush failed: {0}")]
    Flush(#[from] StoreError),

    #[error("worker for {0} missed its shutdown deadline")]
    ShutdownTimeout(ConnectionId),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}
