pub mod database;
pub mod error;
pub mod schema;
pub mod transcripts;

pub use database::Database;
pub use error::StoreError;
pub use transcripts::TranscriptRepo;
