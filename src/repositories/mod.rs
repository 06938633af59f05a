//! # Repository Layer
//!
//! SeaORM access for the two tables the engine owns. Credential writes go through
//! [`ConnectionRepository`]; job lifecycle transitions through [`SyncJobRepository`].

pub mod connection;
pub mod sync_job;
pub mod sync_metadata;

pub use connection::{ConnectionRepository, NewConnection};
pub use sync_job::{JobInfo, JobListFilter, JobPage, SyncJobRepository};
pub use sync_metadata::{
    ConnectionSyncMetadata, effective_interval_seconds, sync_cursor, with_sync_cursor,
};
