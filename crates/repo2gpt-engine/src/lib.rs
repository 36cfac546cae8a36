pub mod chunker;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod repomap;
pub mod runner;
pub mod subscriptions;
pub mod summarize;
pub mod walk;

#[cfg(feature = "hf-tokenizer")]
pub mod hf_tokenizer;

pub use error::EngineError;
pub use runner::{JobRunner, RunnerConfig};
pub use subscriptions::{SubscriptionItem, SubscriptionManager};
