use std::time::Duration;

use repo2gpt_store::StoreError;

use crate::chunker::ChunkError;
use crate::fetch::FetchError;
use crate::filter::FilterError;

/// Fatal pipeline errors. The `Display` text becomes the failed job's error message.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("fetch timeout after {}s", .0.as_secs())]
    FetchTimeout(Duration),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("chunking error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("cancelled")]
    Cancelled,

    /// The runner shut down while the job was in flight.
    #[error("interrupted")]
    Interrupted,

    #[error("{0}")]
    Internal(String),
}
