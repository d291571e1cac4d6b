//! Test fixtures and mock collaborators
//!
//! Recording connectors, static pools, and spec builders used by the unit
//! and integration suites. Everything here runs against the in-memory
//! database backend; nothing requires external services.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use crate::activity::{
    AddActivity, CheckActivity, DocumentStatus, HistoryActivity, IngestActivities,
};
use crate::connector::{
    OutputConnector, OutputConnectorPool, PipelineConnector, TransformationConnector,
    TransformationConnectorPool,
};
use crate::coordinator::IngestCoordinator;
use crate::db::memory::MemDatabase;
use crate::document::Document;
use crate::error::Result;
use crate::locks::InProcessLockRegistry;
use crate::pipeline::{
    PipelineSpec, PipelineSpecWithVersions, PipelineTopology, StoredOutputVersions,
};
use crate::store::IngestRecordStore;
use crate::types::{Specification, VersionContext};

/// One recorded activity event.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub start_time: Option<i64>,
    pub activity_type: String,
    pub data_size: Option<u64>,
    pub entity_uri: Option<String>,
    pub result_code: Option<String>,
    pub result_description: Option<String>,
}

/// Caller-side activity sink: records history, answers every check with
/// "indexable".
#[derive(Debug, Default)]
pub struct RecordingActivity {
    events: Mutex<Vec<ActivityEvent>>,
}

impl RecordingActivity {
    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl HistoryActivity for RecordingActivity {
    async fn record_activity(
        &self,
        start_time: Option<i64>,
        activity_type: &str,
        data_size: Option<u64>,
        entity_uri: Option<&str>,
        result_code: Option<&str>,
        result_description: Option<&str>,
    ) -> Result<()> {
        self.events.lock().push(ActivityEvent {
            start_time,
            activity_type: activity_type.to_string(),
            data_size,
            entity_uri: entity_uri.map(str::to_string),
            result_code: result_code.map(str::to_string),
            result_description: result_description.map(str::to_string),
        });
        Ok(())
    }
}

#[async_trait]
impl CheckActivity for RecordingActivity {
    async fn check_mime_type(&self, _mime_type: &str) -> Result<bool> {
        Ok(true)
    }
    async fn check_file(&self, _local_file: &Path) -> Result<bool> {
        Ok(true)
    }
    async fn check_length(&self, _length: u64) -> Result<bool> {
        Ok(true)
    }
    async fn check_url(&self, _url: &str) -> Result<bool> {
        Ok(true)
    }
}

/// What a recording output connector saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Added {
        uri: String,
        body: Vec<u8>,
        authority: String,
    },
    Removed {
        uri: String,
        output_version: String,
    },
    AllRecordsRemoved,
}

/// An output connector that records every call and accepts (or rejects)
/// everything.
pub struct RecordingOutputConnector {
    events: Mutex<Vec<OutputEvent>>,
    accept: bool,
    indexable: bool,
}

impl RecordingOutputConnector {
    pub fn new() -> Self {
        RecordingOutputConnector {
            events: Mutex::new(Vec::new()),
            accept: true,
            indexable: true,
        }
    }

    /// A connector that permanently rejects every document.
    pub fn rejecting() -> Self {
        RecordingOutputConnector {
            accept: false,
            ..Self::new()
        }
    }

    /// A connector whose check probes answer "not indexable".
    pub fn unindexable() -> Self {
        RecordingOutputConnector {
            indexable: false,
            ..Self::new()
        }
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events.lock().clone()
    }

    /// URIs delivered, in order.
    pub fn added_uris(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Added { uri, .. } => Some(uri),
                _ => None,
            })
            .collect()
    }

    /// URIs removed, in order.
    pub fn removed_uris(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Removed { uri, .. } => Some(uri),
                _ => None,
            })
            .collect()
    }
}

impl Default for RecordingOutputConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineConnector for RecordingOutputConnector {
    async fn pipeline_description(&self, spec: &Specification) -> Result<VersionContext> {
        Ok(VersionContext::new(spec.to_string()))
    }

    async fn check_mime_type(
        &self,
        _description: &VersionContext,
        _mime_type: &str,
        _downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        Ok(self.indexable)
    }

    async fn check_file(
        &self,
        _description: &VersionContext,
        _local_file: &Path,
        _downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        Ok(self.indexable)
    }

    async fn check_length(
        &self,
        _description: &VersionContext,
        _length: u64,
        _downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        Ok(self.indexable)
    }

    async fn check_url(
        &self,
        _description: &VersionContext,
        _url: &str,
        _downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        Ok(self.indexable)
    }
}

#[async_trait]
impl OutputConnector for RecordingOutputConnector {
    async fn add_or_replace(
        &self,
        uri: &str,
        _description: &VersionContext,
        document: Document,
        authority: &str,
        _activities: &dyn IngestActivities,
    ) -> Result<DocumentStatus> {
        let body = document.into_body_bytes().await?.to_vec();
        self.events.lock().push(OutputEvent::Added {
            uri: uri.to_string(),
            body,
            authority: authority.to_string(),
        });
        Ok(if self.accept {
            DocumentStatus::Accepted
        } else {
            DocumentStatus::Rejected
        })
    }

    async fn remove(
        &self,
        uri: &str,
        output_version: &str,
        _activities: &dyn HistoryActivity,
    ) -> Result<()> {
        self.events.lock().push(OutputEvent::Removed {
            uri: uri.to_string(),
            output_version: output_version.to_string(),
        });
        Ok(())
    }

    async fn note_all_records_removed(&self) -> Result<()> {
        self.events.lock().push(OutputEvent::AllRecordsRemoved);
        Ok(())
    }
}

/// A transformation that forwards documents unchanged and counts traffic.
pub struct StubTransformation {
    sends: Mutex<usize>,
}

impl StubTransformation {
    pub fn new() -> Self {
        StubTransformation {
            sends: Mutex::new(0),
        }
    }

    pub fn send_count(&self) -> usize {
        *self.sends.lock()
    }
}

impl Default for StubTransformation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineConnector for StubTransformation {
    async fn pipeline_description(&self, spec: &Specification) -> Result<VersionContext> {
        Ok(VersionContext::new(spec.to_string()))
    }

    async fn check_mime_type(
        &self,
        _description: &VersionContext,
        mime_type: &str,
        downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        downstream.check_mime_type(mime_type).await
    }

    async fn check_file(
        &self,
        _description: &VersionContext,
        local_file: &Path,
        downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        downstream.check_file(local_file).await
    }

    async fn check_length(
        &self,
        _description: &VersionContext,
        length: u64,
        downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        downstream.check_length(length).await
    }

    async fn check_url(
        &self,
        _description: &VersionContext,
        url: &str,
        downstream: &dyn CheckActivity,
    ) -> Result<bool> {
        downstream.check_url(url).await
    }
}

#[async_trait]
impl TransformationConnector for StubTransformation {
    async fn add_or_replace(
        &self,
        uri: Option<&str>,
        _description: &VersionContext,
        document: Document,
        authority: &str,
        downstream: &dyn AddActivity,
    ) -> Result<DocumentStatus> {
        *self.sends.lock() += 1;
        downstream.send_document(uri, document, authority).await
    }
}

/// Fixed-membership connector pools that track grab/release balance.
#[derive(Default)]
pub struct StaticPools {
    outputs: HashMap<String, Arc<dyn OutputConnector>>,
    transformations: HashMap<String, Arc<dyn TransformationConnector>>,
    outstanding: AtomicIsize,
}

impl StaticPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(
        mut self,
        name: impl Into<String>,
        connector: Arc<dyn OutputConnector>,
    ) -> Self {
        self.outputs.insert(name.into(), connector);
        self
    }

    pub fn with_transformation(
        mut self,
        name: impl Into<String>,
        connector: Arc<dyn TransformationConnector>,
    ) -> Self {
        self.transformations.insert(name.into(), connector);
        self
    }

    /// Grabs minus releases; zero when every handle went back.
    pub fn outstanding(&self) -> isize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutputConnectorPool for StaticPools {
    async fn grab(&self, connection: &str) -> Result<Option<Arc<dyn OutputConnector>>> {
        let connector = self.outputs.get(connection).cloned();
        if connector.is_some() {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
        }
        Ok(connector)
    }

    fn release(&self, _connection: &str, _connector: Arc<dyn OutputConnector>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransformationConnectorPool for StaticPools {
    async fn grab(&self, connection: &str) -> Result<Option<Arc<dyn TransformationConnector>>> {
        let connector = self.transformations.get(connection).cloned();
        if connector.is_some() {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
        }
        Ok(connector)
    }

    fn release(&self, _connection: &str, _connector: Arc<dyn TransformationConnector>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A described single-output pipeline.
pub fn single_output_spec(output_connection: &str, output_description: &str) -> PipelineSpec {
    PipelineSpec::new(
        PipelineTopology::single_output(output_connection),
        vec![VersionContext::new(output_description)],
    )
}

/// A versioned spec for a document no output has seen.
pub fn never_indexed(spec: &PipelineSpec) -> PipelineSpecWithVersions {
    let outputs = (0..spec.topology().output_stage_count())
        .map(|_| StoredOutputVersions::never_indexed())
        .collect();
    PipelineSpecWithVersions::new(spec.clone(), outputs)
}

/// A fully wired coordinator over the in-memory backend, with its
/// collaborators exposed for assertions.
pub struct TestHarness {
    pub db: Arc<MemDatabase>,
    pub store: Arc<IngestRecordStore>,
    pub pools: Arc<StaticPools>,
    pub coordinator: IngestCoordinator,
}

impl TestHarness {
    /// Install the schema and wire a coordinator around `pools`.
    pub async fn new(pools: StaticPools) -> Self {
        let db = Arc::new(MemDatabase::new());
        let store = Arc::new(IngestRecordStore::new(db.clone()));
        store.install().await.expect("schema install");
        let pools = Arc::new(pools);
        let coordinator = IngestCoordinator::new(
            store.clone(),
            Arc::new(InProcessLockRegistry::new()),
            pools.clone(),
            pools.clone(),
        );
        TestHarness {
            db,
            store,
            pools,
            coordinator,
        }
    }
}
