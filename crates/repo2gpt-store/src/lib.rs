pub mod artifacts;
pub mod database;
pub mod error;
pub mod events;
pub mod jobs;
pub mod row_helpers;
pub mod schema;
pub mod store;

pub use artifacts::REPOMAP_ARTIFACT;
pub use database::Database;
pub use error::StoreError;
pub use store::{CompletedJob, JobStore};
