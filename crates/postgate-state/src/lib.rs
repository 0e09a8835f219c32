//! postgate-state: persistence layer for the moderation pipeline
//!
//! This crate defines the collaborators the pipeline consumes and provides
//! the durable reply job table.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: job-state atomicity, at-most-one-in-flight per comment, and
//! recoverability of scheduled work across restarts.
//!
//! ## Key Components
//!
//! - `ContentStore` / `IdentityProvider`: ports to the surrounding application
//! - `JobStore`: reply job table with compare-and-set transitions
//! - `SurrealJobStore`: SurrealDB-backed `JobStore` (`mem://`, `surrealkv://`)
//! - `fakes`: in-memory implementations of every trait

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_jobs;

pub use error::{StateError, StorageError};
pub use schema::ReplyJobRow;
pub use storage_traits::{
    AuthorId, AutoReplyPolicy, ContentStore, IdentityProvider, JobId, JobResolution, JobStatus,
    JobStore, ModerationState, NewUnit, ReplyJob, StorageResult, TextUnit, UnitId,
};
pub use surreal_jobs::{SurrealJobStore, DEFAULT_DB_URL};

/// Result type for postgate-state connection and setup operations
pub type Result<T> = std::result::Result<T, StateError>;
