//! Incremental ingestion manager for the DCP document crawl platform
//!
//! Repositories feed documents into one or more downstream indexes
//! ("output connections"), optionally through transformation stages. This
//! crate keeps track of what has been delivered where — one record per
//! (output connection, document key), holding the URI and version
//! fingerprints of the last successful delivery — and coordinates delivery
//! itself through a fan-out pipeline, so that each output independently
//! receives exactly the documents whose fingerprints changed.
//!
//! The entry point is [`IngestCoordinator`]. It is wired from four
//! collaborators:
//!
//! - an [`store::IngestRecordStore`] over a [`db::DbInterface`] backend
//!   (Postgres in production, in-memory for tests and embedding),
//! - a [`locks::LockRegistry`] serializing work per downstream URI,
//! - output and transformation connector pools ([`connector`]).
//!
//! Worker threads call the coordinator concurrently; consistency under
//! contention comes from URI locks, the unique (doc_key, output) index, and
//! retry loops around transient database aborts, not from any global lock.

pub mod activity;
pub mod connector;
pub mod coordinator;
pub mod db;
pub mod document;
pub mod error;
pub mod locks;
pub mod pipeline;
pub mod store;
pub mod testing;
pub mod types;
pub mod versioning;

mod retry;

pub use activity::{AddActivity, CheckActivity, DocumentStatus, HistoryActivity, IngestActivities};
pub use coordinator::IngestCoordinator;
pub use document::{Document, DocumentFactory};
pub use error::{IngestError, Result};
pub use pipeline::{
    PipelineSpec, PipelineSpecWithVersions, PipelineTopology, StageDef, StageKind,
    StoredOutputVersions,
};
pub use types::{DocumentIngestStatus, OutputKey, Specification, VersionContext};
