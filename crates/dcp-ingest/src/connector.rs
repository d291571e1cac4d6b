//! Connector collaborator interfaces
//!
//! Connectors are external binaries (or in-process adapters) the ingestion
//! manager drives but does not implement: transformation stages that rewrite
//! documents and output stages that talk to a downstream index. Handles come
//! from pool managers; a pool answering `None` means the connector is not
//! installed, which callers surface as a service interruption.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::activity::{
    AddActivity, CheckActivity, DocumentStatus, HistoryActivity, IngestActivities,
};
use crate::document::Document;
use crate::error::Result;
use crate::types::{Specification, VersionContext};

/// Operations common to transformation and output connectors.
#[async_trait]
pub trait PipelineConnector: Send + Sync {
    /// Summarize a stage specification as an opaque version fingerprint.
    async fn pipeline_description(&self, spec: &Specification) -> Result<VersionContext>;

    /// Would a document with this mime type be acceptable?
    async fn check_mime_type(
        &self,
        description: &VersionContext,
        mime_type: &str,
        downstream: &dyn CheckActivity,
    ) -> Result<bool>;

    /// Would this local file be acceptable?
    async fn check_file(
        &self,
        description: &VersionContext,
        local_file: &Path,
        downstream: &dyn CheckActivity,
    ) -> Result<bool>;

    /// Would a document of this length be acceptable?
    async fn check_length(
        &self,
        description: &VersionContext,
        length: u64,
        downstream: &dyn CheckActivity,
    ) -> Result<bool>;

    /// Would a document at this URL be acceptable?
    async fn check_url(
        &self,
        description: &VersionContext,
        url: &str,
        downstream: &dyn CheckActivity,
    ) -> Result<bool>;
}

/// A transformation stage: receives each document, rewrites or enriches it,
/// and hands the result onward through the injected [`AddActivity`] pipe.
#[async_trait]
pub trait TransformationConnector: PipelineConnector {
    async fn add_or_replace(
        &self,
        uri: Option<&str>,
        description: &VersionContext,
        document: Document,
        authority: &str,
        downstream: &dyn AddActivity,
    ) -> Result<DocumentStatus>;
}

/// An output stage: the connection to one downstream index.
#[async_trait]
pub trait OutputConnector: PipelineConnector {
    /// Deliver a document, replacing whatever the index holds at `uri`.
    /// There is no pipeline below an output, so `activities` offers checks
    /// and history but no onward send.
    async fn add_or_replace(
        &self,
        uri: &str,
        description: &VersionContext,
        document: Document,
        authority: &str,
        activities: &dyn IngestActivities,
    ) -> Result<DocumentStatus>;

    /// Remove the document at `uri` from the index. `output_version` is the
    /// stage description recorded when the document was delivered.
    async fn remove(
        &self,
        uri: &str,
        output_version: &str,
        activities: &dyn HistoryActivity,
    ) -> Result<()>;

    /// Called after every local record for this connection has been dropped,
    /// so the connector can clear any state of its own.
    async fn note_all_records_removed(&self) -> Result<()>;
}

/// Pool of output connector handles, keyed by connection name.
///
/// `grab` waits for a free handle and returns `None` when the connector
/// class is not installed. `release` is synchronous so it can run on every
/// exit path without an async drop.
#[async_trait]
pub trait OutputConnectorPool: Send + Sync {
    async fn grab(&self, connection: &str) -> Result<Option<Arc<dyn OutputConnector>>>;
    fn release(&self, connection: &str, connector: Arc<dyn OutputConnector>);
}

/// Pool of transformation connector handles, keyed by connection name.
#[async_trait]
pub trait TransformationConnectorPool: Send + Sync {
    async fn grab(&self, connection: &str) -> Result<Option<Arc<dyn TransformationConnector>>>;
    fn release(&self, connection: &str, connector: Arc<dyn TransformationConnector>);
}
