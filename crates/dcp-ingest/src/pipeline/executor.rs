//! Executable pipeline trees
//!
//! Built by [`super::builder`]; two shapes exist. A check pipeline answers
//! "would the pipeline accept this document?" by ORing across siblings: a
//! document indexable by at least one output is indexable by the pipeline.
//! An add pipeline actually delivers a document, duplicating it at fan-out
//! points so every active sibling reads an independent stream, and ending in
//! per-output leaves that keep the ingest-state table consistent with what
//! the downstream index was told.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::activity::{
    AddActivity, CheckActivity, DocumentStatus, HistoryActivity, IngestActivities,
    QualifiedActivitySink,
};
use crate::connector::{OutputConnector, TransformationConnector};
use crate::document::{Document, DocumentFactory};
use crate::error::Result;
use crate::locks::{lock_all, LockRegistry};
use crate::store::{IngestRecordStore, RecordFields, UpsertOutcome, UriFields};
use crate::types::VersionContext;
use dcp_common::hash::uri_hash;

/// A handle to whichever connector kind runs a stage.
pub(crate) enum StageConnector {
    Output(Arc<dyn OutputConnector>),
    Transformation(Arc<dyn TransformationConnector>),
}

impl StageConnector {
    async fn check_mime_type(
        &self,
        description: &VersionContext,
        mime_type: &str,
        downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        match self {
            StageConnector::Output(c) => c.check_mime_type(description, mime_type, downstream).await,
            StageConnector::Transformation(c) => {
                c.check_mime_type(description, mime_type, downstream).await
            },
        }
    }

    async fn check_file(
        &self,
        description: &VersionContext,
        local_file: &Path,
        downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        match self {
            StageConnector::Output(c) => c.check_file(description, local_file, downstream).await,
            StageConnector::Transformation(c) => {
                c.check_file(description, local_file, downstream).await
            },
        }
    }

    async fn check_length(
        &self,
        description: &VersionContext,
        length: u64,
        downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        match self {
            StageConnector::Output(c) => c.check_length(description, length, downstream).await,
            StageConnector::Transformation(c) => {
                c.check_length(description, length, downstream).await
            },
        }
    }

    async fn check_url(
        &self,
        description: &VersionContext,
        url: &str,
        downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        match self {
            StageConnector::Output(c) => c.check_url(description, url, downstream).await,
            StageConnector::Transformation(c) => c.check_url(description, url, downstream).await,
        }
    }
}

/// What a check entry point probes into: a deeper fan-out, or the caller's
/// terminal activity at the end of the pipeline.
pub(crate) enum CheckTarget {
    Fanout(Box<CheckFanout>),
    Final(Arc<dyn CheckActivity>),
}

/// One stage of a check pipeline.
pub(crate) struct CheckEntryPoint {
    pub(crate) connector: StageConnector,
    pub(crate) description: VersionContext,
    pub(crate) downstream: CheckTarget,
}

impl CheckEntryPoint {
    fn downstream(&self) -> &dyn CheckActivity {
        match &self.downstream {
            CheckTarget::Fanout(fanout) => fanout.as_ref(),
            CheckTarget::Final(activity) => activity.as_ref(),
        }
    }
}

/// Sibling set in a check pipeline; answers are ORed.
pub(crate) struct CheckFanout {
    pub(crate) children: Vec<CheckEntryPoint>,
}

#[async_trait]
impl CheckActivity for CheckFanout {
    async fn check_mime_type(&self, mime_type: &str) -> Result<bool> {
        for child in &self.children {
            if child
                .connector
                .check_mime_type(&child.description, mime_type, child.downstream())
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_file(&self, local_file: &Path) -> Result<bool> {
        for child in &self.children {
            if child
                .connector
                .check_file(&child.description, local_file, child.downstream())
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_length(&self, length: u64) -> Result<bool> {
        for child in &self.children {
            if child
                .connector
                .check_length(&child.description, length, child.downstream())
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_url(&self, url: &str) -> Result<bool> {
        for child in &self.children {
            if child
                .connector
                .check_url(&child.description, url, child.downstream())
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// One stage of an add pipeline.
pub(crate) enum AddEntryPoint {
    Transformation(TransformationAddEntry),
    Output(Box<OutputAddEntry>),
}

impl AddEntryPoint {
    pub(crate) fn is_active(&self) -> bool {
        match self {
            AddEntryPoint::Transformation(entry) => entry.active,
            AddEntryPoint::Output(entry) => entry.active,
        }
    }

    async fn send(
        &self,
        uri: Option<&str>,
        document: Document,
        authority: &str,
    ) -> Result<DocumentStatus> {
        match self {
            AddEntryPoint::Transformation(entry) => {
                entry
                    .connector
                    .add_or_replace(uri, &entry.description, document, authority, &entry.downstream)
                    .await
            },
            AddEntryPoint::Output(entry) => entry.send(uri, document, authority).await,
        }
    }

    async fn check_mime_type(&self, mime_type: &str) -> Result<bool> {
        match self {
            AddEntryPoint::Transformation(entry) => {
                entry
                    .connector
                    .check_mime_type(&entry.description, mime_type, &entry.downstream)
                    .await
            },
            AddEntryPoint::Output(entry) => {
                entry
                    .connector
                    .check_mime_type(&entry.description, mime_type, &entry.pipe)
                    .await
            },
        }
    }

    async fn check_file(&self, local_file: &Path) -> Result<bool> {
        match self {
            AddEntryPoint::Transformation(entry) => {
                entry
                    .connector
                    .check_file(&entry.description, local_file, &entry.downstream)
                    .await
            },
            AddEntryPoint::Output(entry) => {
                entry
                    .connector
                    .check_file(&entry.description, local_file, &entry.pipe)
                    .await
            },
        }
    }

    async fn check_length(&self, length: u64) -> Result<bool> {
        match self {
            AddEntryPoint::Transformation(entry) => {
                entry
                    .connector
                    .check_length(&entry.description, length, &entry.downstream)
                    .await
            },
            AddEntryPoint::Output(entry) => {
                entry
                    .connector
                    .check_length(&entry.description, length, &entry.pipe)
                    .await
            },
        }
    }

    async fn check_url(&self, url: &str) -> Result<bool> {
        match self {
            AddEntryPoint::Transformation(entry) => {
                entry
                    .connector
                    .check_url(&entry.description, url, &entry.downstream)
                    .await
            },
            AddEntryPoint::Output(entry) => {
                entry
                    .connector
                    .check_url(&entry.description, url, &entry.pipe)
                    .await
            },
        }
    }
}

/// A transformation stage bound to the fan-out below it.
pub(crate) struct TransformationAddEntry {
    pub(crate) connector: Arc<dyn TransformationConnector>,
    pub(crate) description: VersionContext,
    pub(crate) downstream: AddFanout,
    /// A transformation is active iff any output below it needs the send.
    pub(crate) active: bool,
}

/// Sibling set in an add pipeline. This is the [`AddActivity`] pipe handed
/// to the transformation connector above it.
pub(crate) struct AddFanout {
    pub(crate) children: Vec<AddEntryPoint>,
    /// History sink for activity recorded at this level, already qualified
    /// with the parent transformation's connection name (or the caller's
    /// raw sink at the root).
    pub(crate) history: Arc<dyn HistoryActivity>,
}

impl AddFanout {
    pub(crate) fn any_active(&self) -> bool {
        self.children.iter().any(AddEntryPoint::is_active)
    }
}

#[async_trait]
impl CheckActivity for AddFanout {
    async fn check_mime_type(&self, mime_type: &str) -> Result<bool> {
        for child in &self.children {
            if child.check_mime_type(mime_type).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_file(&self, local_file: &Path) -> Result<bool> {
        for child in &self.children {
            if child.check_file(local_file).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_length(&self, length: u64) -> Result<bool> {
        for child in &self.children {
            if child.check_length(length).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_url(&self, url: &str) -> Result<bool> {
        for child in &self.children {
            if child.check_url(url).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl HistoryActivity for AddFanout {
    async fn record_activity(
        &self,
        start_time: Option<i64>,
        activity_type: &str,
        data_size: Option<u64>,
        entity_uri: Option<&str>,
        result_code: Option<&str>,
        result_description: Option<&str>,
    ) -> Result<()> {
        self.history
            .record_activity(
                start_time,
                activity_type,
                data_size,
                entity_uri,
                result_code,
                result_description,
            )
            .await
    }
}

#[async_trait]
impl AddActivity for AddFanout {
    async fn send_document(
        &self,
        uri: Option<&str>,
        document: Document,
        authority: &str,
    ) -> Result<DocumentStatus> {
        let active: Vec<&AddEntryPoint> =
            self.children.iter().filter(|c| c.is_active()).collect();
        match active.len() {
            0 => Ok(DocumentStatus::Rejected),
            1 => active[0].send(uri, document, authority).await,
            _ => {
                // Several siblings need their own view of the stream: spool
                // once, replicate cheaply.
                let factory = DocumentFactory::new(document).await?;
                let mut status = DocumentStatus::Rejected;
                for child in active {
                    if child.send(uri, factory.document(), authority).await?
                        == DocumentStatus::Accepted
                    {
                        status = DocumentStatus::Accepted;
                    }
                }
                Ok(status)
            },
        }
    }
}

/// Activities handed to an output connector during delivery: probes answer
/// from the caller's terminal activity, history is qualified by the output
/// connection name. There is nothing downstream of an output to send to.
pub(crate) struct OutputLeafActivities {
    terminal: Arc<dyn IngestActivities>,
    sink: QualifiedActivitySink,
}

#[async_trait]
impl CheckActivity for OutputLeafActivities {
    async fn check_mime_type(&self, mime_type: &str) -> Result<bool> {
        self.terminal.check_mime_type(mime_type).await
    }

    async fn check_file(&self, local_file: &Path) -> Result<bool> {
        self.terminal.check_file(local_file).await
    }

    async fn check_length(&self, length: u64) -> Result<bool> {
        self.terminal.check_length(length).await
    }

    async fn check_url(&self, url: &str) -> Result<bool> {
        self.terminal.check_url(url).await
    }
}

#[async_trait]
impl HistoryActivity for OutputLeafActivities {
    async fn record_activity(
        &self,
        start_time: Option<i64>,
        activity_type: &str,
        data_size: Option<u64>,
        entity_uri: Option<&str>,
        result_code: Option<&str>,
        result_description: Option<&str>,
    ) -> Result<()> {
        self.sink
            .record_activity(
                start_time,
                activity_type,
                data_size,
                entity_uri,
                result_code,
                result_description,
            )
            .await
    }
}

/// The per-output leaf of an add pipeline.
pub(crate) struct OutputAddEntry {
    pub(crate) connector: Arc<dyn OutputConnector>,
    pub(crate) description: VersionContext,
    pub(crate) pipe: OutputLeafActivities,
    pub(crate) active: bool,
    pub(crate) output_connection: String,
    pub(crate) transformation_version: String,
    pub(crate) document_version: String,
    pub(crate) parameter_version: String,
    pub(crate) doc_key: String,
    pub(crate) ingest_time: i64,
    pub(crate) store: Arc<IngestRecordStore>,
    pub(crate) locks: Arc<dyn LockRegistry>,
}

impl OutputAddEntry {
    pub(crate) fn new(
        connector: Arc<dyn OutputConnector>,
        description: VersionContext,
        terminal: Arc<dyn IngestActivities>,
        active: bool,
        output_connection: String,
        transformation_version: String,
        document_version: String,
        parameter_version: String,
        doc_key: String,
        ingest_time: i64,
        store: Arc<IngestRecordStore>,
        locks: Arc<dyn LockRegistry>,
    ) -> Self {
        let sink = QualifiedActivitySink::new(output_connection.clone(), terminal.clone());
        OutputAddEntry {
            connector,
            description,
            pipe: OutputLeafActivities { terminal, sink },
            active,
            output_connection,
            transformation_version,
            document_version,
            parameter_version,
            doc_key,
            ingest_time,
            store,
            locks,
        }
    }

    /// Deliver (or record) one document at this output.
    ///
    /// No transaction spans the connector call: delivery latency can exceed
    /// any sane transaction timeout. Consistency comes from the URI locks,
    /// the displacement deletes, and the pre-ingest placeholder row written
    /// before the send (a crash mid-send leaves a row with an unknown
    /// version, so the next pass resends instead of silently skipping).
    async fn send(
        &self,
        uri: Option<&str>,
        document: Document,
        authority: &str,
    ) -> Result<DocumentStatus> {
        let new_uri_hash = uri.map(uri_hash);

        let prior = self
            .store
            .find_uri_state(&self.output_connection, &self.doc_key)
            .await?;

        // Serialize against anyone else working on either URI. Hash
        // collisions make hash-only reasoning unsafe, so locks are on the
        // full URIs.
        let mut lock_names = Vec::new();
        if let Some(new_uri) = uri {
            lock_names.push(format!("{}:{}", self.output_connection, new_uri));
        }
        if let Some(old_uri) = &prior.uri {
            if uri != Some(old_uri.as_str()) {
                lock_names.push(format!("{}:{}", self.output_connection, old_uri));
            }
        }
        let _guard = lock_all(self.locks.clone(), lock_names).await?;

        if let Some(old_uri) = &prior.uri {
            if uri != Some(old_uri.as_str()) {
                // The document is moving off its old URI: displace the
                // local mirror first, then the remote copy. A crash between
                // the two strands the remote document until something
                // reassigns that URI.
                debug!(
                    doc_key = %self.doc_key,
                    old_uri = %old_uri,
                    "document URI changed, removing old delivery"
                );
                if let Some(old_hash) = &prior.uri_hash {
                    self.store
                        .delete_other_rows_with_uri_hash(
                            &self.output_connection,
                            old_hash,
                            &self.doc_key,
                        )
                        .await?;
                }
                self.connector
                    .remove(
                        old_uri,
                        prior.output_version.as_deref().unwrap_or(""),
                        &self.pipe,
                    )
                    .await?;
            }
        }

        if let Some(new_uri) = uri {
            let new_uri_hash = new_uri_hash.as_deref().unwrap_or_default();
            // Whatever document previously occupied the new URI is being
            // replaced; its mirror rows must go.
            self.store
                .delete_other_rows_with_uri_hash(
                    &self.output_connection,
                    new_uri_hash,
                    &self.doc_key,
                )
                .await?;

            // Placeholder before the send: "something is (possibly) there,
            // version unknown". Not an ingestion event in itself.
            let placeholder = self
                .store
                .upsert_record(
                    &self.output_connection,
                    &self.doc_key,
                    &RecordFields {
                        uri: Some(UriFields {
                            uri: new_uri,
                            uri_hash: new_uri_hash,
                        }),
                        ..RecordFields::default()
                    },
                    self.ingest_time,
                    false,
                )
                .await?;

            let status = self
                .connector
                .add_or_replace(new_uri, &self.description, document, authority, &self.pipe)
                .await?;

            // Record the fingerprints whether accepted or rejected; a
            // rejection is permanent and must not be retried forever. If the
            // placeholder created the row, its change_count of 1 already
            // counts this delivery.
            self.store
                .upsert_record(
                    &self.output_connection,
                    &self.doc_key,
                    &self.full_fields(authority, Some((new_uri, new_uri_hash))),
                    self.ingest_time,
                    placeholder == UpsertOutcome::Updated,
                )
                .await?;
            return Ok(status);
        }

        // No URI: the connector chose "record the version, don't index".
        self.store
            .upsert_record(
                &self.output_connection,
                &self.doc_key,
                &self.full_fields(authority, None),
                self.ingest_time,
                true,
            )
            .await?;
        Ok(DocumentStatus::Accepted)
    }

    fn full_fields<'a>(
        &'a self,
        authority: &'a str,
        uri: Option<(&'a str, &'a str)>,
    ) -> RecordFields<'a> {
        RecordFields {
            document_version: Some(&self.document_version),
            transformation_version: Some(&self.transformation_version),
            output_version: Some(self.description.as_str()),
            parameter_version: Some(&self.parameter_version),
            authority_name: Some(authority),
            uri: uri.map(|(uri, uri_hash)| UriFields { uri, uri_hash }),
        }
    }
}
