pub mod mock;
pub mod provider;

pub use mock::{MockProvider, MockReply};
pub use provider::{HttpProvider, InferenceProvider};
