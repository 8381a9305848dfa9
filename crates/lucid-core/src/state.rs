use serde::{Deserialize, Serialize};

/// Lifecycle state of a client connection.
///
/// The machine is strictly forward: `Connecting → Active → Closing → Closed`.
/// A connection that dies mid-handshake may skip Active and go straight to
/// Closing; nothing ever moves backwards and Closed is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{Active, Closed, Closing, Connecting};
        matches!(
            (self, next),
            (Connecting, Active) | (Connecting, Closing) | (Active, Closing) | (Closing, Closed)
        )
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
