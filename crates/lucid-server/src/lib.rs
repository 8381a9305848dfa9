//! WebSocket transport boundary for the relay: frame decoding, the
//! per-socket reader/writer tasks and the HTTP surface.

pub mod frames;
pub mod server;

pub use frames::ClientFrame;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
