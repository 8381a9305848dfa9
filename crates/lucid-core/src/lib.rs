pub mod config;
pub mod envelope;
pub mod errors;
pub mod history;
pub mod ids;
pub mod state;
