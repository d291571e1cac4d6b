//! Ingestion coordinator
//!
//! The façade the crawler's worker threads call. It owns the wiring between
//! the record store, the lock registry, the connector pools, and the
//! pipeline machinery, and it enforces the resource discipline: connector
//! handles grabbed before use and released on every exit path, connector
//! calls outside database transactions, URI locks around every piece of
//! work that touches a downstream document.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::activity::{
    AddActivity, CheckActivity, DocumentStatus, HistoryActivity, IngestActivities,
    QualifiedActivitySink,
};
use crate::connector::{OutputConnectorPool, TransformationConnectorPool};
use crate::document::Document;
use crate::error::{IngestError, Result};
use crate::locks::{lock_all, LockRegistry};
use crate::pipeline::builder::{
    build_add_pipeline, build_check_pipeline, AddContext, PipelineConnectors,
};
use crate::pipeline::{PipelineSpec, PipelineSpecWithVersions, PipelineTopology};
use crate::store::{IngestRecordStore, RecordFields};
use crate::types::{make_doc_key, DocumentIngestStatus, OutputKey, Specification, VersionContext};
use crate::versioning;

/// The incremental ingestion manager.
pub struct IngestCoordinator {
    store: Arc<IngestRecordStore>,
    locks: Arc<dyn LockRegistry>,
    output_pool: Arc<dyn OutputConnectorPool>,
    transformation_pool: Arc<dyn TransformationConnectorPool>,
}

impl IngestCoordinator {
    pub fn new(
        store: Arc<IngestRecordStore>,
        locks: Arc<dyn LockRegistry>,
        output_pool: Arc<dyn OutputConnectorPool>,
        transformation_pool: Arc<dyn TransformationConnectorPool>,
    ) -> Self {
        IngestCoordinator {
            store,
            locks,
            output_pool,
            transformation_pool,
        }
    }

    /// Create or reconcile the backing table. Run at startup.
    pub async fn install(&self) -> Result<()> {
        Ok(self.store.install().await?)
    }

    /// Drop the backing table.
    pub async fn deinstall(&self) -> Result<()> {
        Ok(self.store.deinstall().await?)
    }

    /// Flush all knowledge of what was ingested before.
    pub async fn clear_all(&self) -> Result<()> {
        Ok(self.store.clear_all().await?)
    }

    /// The output connection indexed last in the pipeline, if any.
    pub fn last_indexed_output_connection_name<'a>(
        &self,
        topology: &'a PipelineTopology,
    ) -> Option<&'a str> {
        let count = topology.output_stage_count();
        if count == 0 {
            return None;
        }
        Some(topology.connection_name(topology.output_stage(count - 1)))
    }

    /// Is a document with this mime type indexable by at least one output?
    pub async fn check_mime_type(
        &self,
        spec: &PipelineSpec,
        mime_type: &str,
        activities: Arc<dyn CheckActivity>,
    ) -> Result<bool> {
        let connectors = self.grab_pipeline(spec.topology()).await?;
        let pipeline = build_check_pipeline(spec, &connectors, activities);
        let result = pipeline.check_mime_type(mime_type).await;
        self.release_pipeline(connectors);
        result
    }

    /// Is this local file indexable by at least one output?
    pub async fn check_file(
        &self,
        spec: &PipelineSpec,
        local_file: &std::path::Path,
        activities: Arc<dyn CheckActivity>,
    ) -> Result<bool> {
        let connectors = self.grab_pipeline(spec.topology()).await?;
        let pipeline = build_check_pipeline(spec, &connectors, activities);
        let result = pipeline.check_file(local_file).await;
        self.release_pipeline(connectors);
        result
    }

    /// Is a document of this length indexable by at least one output?
    pub async fn check_length(
        &self,
        spec: &PipelineSpec,
        length: u64,
        activities: Arc<dyn CheckActivity>,
    ) -> Result<bool> {
        let connectors = self.grab_pipeline(spec.topology()).await?;
        let pipeline = build_check_pipeline(spec, &connectors, activities);
        let result = pipeline.check_length(length).await;
        self.release_pipeline(connectors);
        result
    }

    /// Is a document at this URL indexable by at least one output?
    pub async fn check_url(
        &self,
        spec: &PipelineSpec,
        url: &str,
        activities: Arc<dyn CheckActivity>,
    ) -> Result<bool> {
        let connectors = self.grab_pipeline(spec.topology()).await?;
        let pipeline = build_check_pipeline(spec, &connectors, activities);
        let result = pipeline.check_url(url).await;
        self.release_pipeline(connectors);
        result
    }

    /// Ask an output connector to fingerprint a stage specification.
    pub async fn get_output_description(
        &self,
        output_connection: &str,
        spec: &Specification,
    ) -> Result<VersionContext> {
        let Some(connector) = self.output_pool.grab(output_connection).await? else {
            return Err(IngestError::interruption("output connector not installed"));
        };
        let result = connector.pipeline_description(spec).await;
        self.output_pool.release(output_connection, connector);
        result
    }

    /// Ask a transformation connector to fingerprint a stage specification.
    pub async fn get_transformation_description(
        &self,
        transformation_connection: &str,
        spec: &Specification,
    ) -> Result<VersionContext> {
        let Some(connector) = self.transformation_pool.grab(transformation_connection).await?
        else {
            return Err(IngestError::interruption(
                "transformation connector not installed",
            ));
        };
        let result = connector.pipeline_description(spec).await;
        self.transformation_pool
            .release(transformation_connection, connector);
        result
    }

    /// Must this document be fetched (or refetched)? Pure comparison of the
    /// stored fingerprints against the newly observed ones; no I/O.
    pub fn check_fetch_document(
        &self,
        spec: &PipelineSpecWithVersions,
        new_document_version: &str,
        new_parameter_version: &str,
        new_authority: &str,
    ) -> bool {
        versioning::needs_reindex(
            spec,
            new_document_version,
            new_parameter_version,
            new_authority,
        )
    }

    /// Record a document version without delivering the document, so change
    /// frequency keeps being tracked. Any URI previously delivered for this
    /// document is removed from the downstream index.
    pub async fn document_record(
        &self,
        topology: &PipelineTopology,
        identifier_class: &str,
        identifier_hash: &str,
        document_version: &str,
        record_time: i64,
        activities: Arc<dyn HistoryActivity>,
    ) -> Result<()> {
        let doc_key = make_doc_key(identifier_class, identifier_hash);
        debug!(doc_key = %doc_key, "recording document version without ingest");

        for index in 0..topology.output_stage_count() {
            let output = topology
                .connection_name(topology.output_stage(index))
                .to_string();
            let prior = self.store.find_uri_state(&output, &doc_key).await?;

            let mut lock_names = Vec::new();
            if let Some(old_uri) = &prior.uri {
                lock_names.push(format!("{output}:{old_uri}"));
            }
            let _guard = lock_all(self.locks.clone(), lock_names).await?;

            if let Some(old_uri) = &prior.uri {
                // Remote removal first, then the local mirrors of that URI.
                let sink = QualifiedActivitySink::new(output.clone(), activities.clone());
                let Some(connector) = self.output_pool.grab(&output).await? else {
                    return Err(IngestError::interruption("output connector not installed"));
                };
                let removed = connector
                    .remove(
                        old_uri,
                        prior.output_version.as_deref().unwrap_or(""),
                        &sink,
                    )
                    .await;
                self.output_pool.release(&output, connector);
                removed?;

                if let Some(old_hash) = &prior.uri_hash {
                    self.store
                        .delete_other_rows_with_uri_hash(&output, old_hash, &doc_key)
                        .await?;
                }
            }

            // Version noted, nothing delivered: the record keeps (or takes)
            // a NULL URI shape on insert.
            self.store
                .upsert_record(
                    &output,
                    &doc_key,
                    &RecordFields {
                        document_version: Some(document_version),
                        ..RecordFields::default()
                    },
                    record_time,
                    true,
                )
                .await?;
        }
        Ok(())
    }

    /// Deliver a document through the pipeline. Returns `true` if at least
    /// one output accepted it, `false` if it was rejected everywhere
    /// (permanent; do not retry).
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip_all, fields(class = %identifier_class, hash = %identifier_hash))]
    pub async fn document_ingest(
        &self,
        spec: &PipelineSpecWithVersions,
        identifier_class: &str,
        identifier_hash: &str,
        document_version: &str,
        parameter_version: &str,
        authority: &str,
        mut document: Document,
        ingest_time: i64,
        document_uri: Option<&str>,
        activities: Arc<dyn IngestActivities>,
    ) -> Result<bool> {
        let doc_key = make_doc_key(identifier_class, identifier_hash);
        debug!(doc_key = %doc_key, uri = ?document_uri, "ingesting document");
        document.indexing_date = Some(Utc::now());

        let connectors = self.grab_pipeline(spec.topology()).await?;
        let context = AddContext {
            store: self.store.clone(),
            locks: self.locks.clone(),
            activities,
            doc_key: &doc_key,
            document_version,
            parameter_version,
            authority,
            ingest_time,
        };
        let pipeline = build_add_pipeline(spec, &connectors, &context);
        let result = pipeline.send_document(document_uri, document, authority).await;
        self.release_pipeline(connectors);
        Ok(result? == DocumentStatus::Accepted)
    }

    /// Note that a document was checked and found current.
    pub async fn document_check(
        &self,
        topology: &PipelineTopology,
        identifier_class: &str,
        identifier_hash: &str,
        check_time: i64,
    ) -> Result<()> {
        self.document_check_multiple(topology, &[(identifier_class, identifier_hash)], check_time)
            .await
    }

    /// Note that a set of documents was checked and found current.
    pub async fn document_check_multiple(
        &self,
        topology: &PipelineTopology,
        documents: &[(&str, &str)],
        check_time: i64,
    ) -> Result<()> {
        let outputs = topology.unique_output_connection_names();
        let doc_keys = doc_keys_of(documents);
        Ok(self
            .store
            .update_last_ingest(&outputs, &doc_keys, check_time)
            .await?)
    }

    /// Delete a document from every output in the pipeline.
    pub async fn document_delete(
        &self,
        topology: &PipelineTopology,
        identifier_class: &str,
        identifier_hash: &str,
        activities: Arc<dyn HistoryActivity>,
    ) -> Result<()> {
        self.document_delete_multiple_same_spec(
            topology,
            &[(identifier_class, identifier_hash)],
            activities,
        )
        .await
    }

    /// Delete documents that may belong to different pipeline
    /// specifications. `specs` and `documents` run in parallel; documents
    /// are grouped by equal topology and deleted per group.
    pub async fn document_delete_multiple(
        &self,
        specs: &[&PipelineTopology],
        documents: &[(&str, &str)],
        activities: Arc<dyn HistoryActivity>,
    ) -> Result<()> {
        assert_eq!(specs.len(), documents.len(), "one spec per document");
        let mut groups: HashMap<&PipelineTopology, Vec<(&str, &str)>> = HashMap::new();
        for (spec, document) in specs.iter().zip(documents) {
            groups.entry(spec).or_default().push(*document);
        }
        for (topology, group) in groups {
            self.document_delete_multiple_same_spec(topology, &group, activities.clone())
                .await?;
        }
        Ok(())
    }

    /// Delete a set of documents that share one pipeline specification.
    pub async fn document_delete_multiple_same_spec(
        &self,
        topology: &PipelineTopology,
        documents: &[(&str, &str)],
        activities: Arc<dyn HistoryActivity>,
    ) -> Result<()> {
        let doc_keys = doc_keys_of(documents);

        // One output connection at a time; connector removals happen
        // outside any database transaction, since their latency can exceed
        // transaction timeouts.
        for output in topology.unique_output_connection_names() {
            debug!(output = %output, count = doc_keys.len(), "deleting documents from output");
            let infos = self.store.find_delete_infos(&output, &doc_keys).await?;
            let uris: HashSet<String> = infos.values().filter_map(|i| i.uri.clone()).collect();

            // Lock every URI we are about to remove so no concurrent ingest
            // can interleave; when this completes, the table reflects
            // reality.
            let lock_names = uris.iter().map(|u| format!("{output}:{u}")).collect();
            let _guard = lock_all(self.locks.clone(), lock_names).await?;

            if !uris.is_empty() {
                let sink = QualifiedActivitySink::new(output.clone(), activities.clone());
                let Some(connector) = self.output_pool.grab(&output).await? else {
                    return Err(IngestError::interruption("output connector not installed"));
                };
                let mut removal = Ok(());
                for info in infos.values() {
                    if let Some(uri) = &info.uri {
                        removal = connector
                            .remove(uri, info.output_version.as_deref().unwrap_or(""), &sink)
                            .await;
                        if removal.is_err() {
                            break;
                        }
                    }
                }
                self.output_pool.release(&output, connector);
                removal?;
            }

            self.store.delete_rows_for(&output, &uris, &doc_keys).await?;
        }
        Ok(())
    }

    /// Load the stored ingest status of a document into `results`, one
    /// entry per (document, output) pair that has a record.
    pub async fn get_pipeline_document_ingest_data(
        &self,
        results: &mut HashMap<OutputKey, DocumentIngestStatus>,
        topology: &PipelineTopology,
        identifier_class: &str,
        identifier_hash: &str,
    ) -> Result<()> {
        self.get_pipeline_document_ingest_data_multiple(
            results,
            topology,
            &[(identifier_class, identifier_hash)],
        )
        .await
    }

    /// Load stored ingest statuses for a set of documents sharing one
    /// pipeline specification. Documents with no record simply contribute
    /// no entries.
    pub async fn get_pipeline_document_ingest_data_multiple(
        &self,
        results: &mut HashMap<OutputKey, DocumentIngestStatus>,
        topology: &PipelineTopology,
        documents: &[(&str, &str)],
    ) -> Result<()> {
        let outputs = topology.unique_output_connection_names();
        let doc_keys = doc_keys_of(documents);
        let by_key: HashMap<String, (&str, &str)> = documents
            .iter()
            .map(|(class, hash)| (make_doc_key(class, hash), (*class, *hash)))
            .collect();

        for row in self.store.load_ingest_statuses(&outputs, &doc_keys).await? {
            if let Some((class, hash)) = by_key.get(&row.doc_key) {
                results.insert(
                    OutputKey::new(*class, *hash, row.output_connection),
                    row.status,
                );
            }
        }
        Ok(())
    }

    /// Like [`Self::get_pipeline_document_ingest_data_multiple`], for
    /// documents that may belong to different specifications.
    pub async fn get_pipeline_document_ingest_data_grouped(
        &self,
        results: &mut HashMap<OutputKey, DocumentIngestStatus>,
        specs: &[&PipelineTopology],
        documents: &[(&str, &str)],
    ) -> Result<()> {
        assert_eq!(specs.len(), documents.len(), "one spec per document");
        let mut groups: HashMap<&PipelineTopology, Vec<(&str, &str)>> = HashMap::new();
        for (spec, document) in specs.iter().zip(documents) {
            groups.entry(spec).or_default().push(*document);
        }
        for (topology, group) in groups {
            self.get_pipeline_document_ingest_data_multiple(results, topology, &group)
                .await?;
        }
        Ok(())
    }

    /// Average interval between observed changes of a document, in ms: the
    /// minimum across the pipeline's outputs, or 0 if never ingested.
    pub async fn get_document_update_interval(
        &self,
        topology: &PipelineTopology,
        identifier_class: &str,
        identifier_hash: &str,
    ) -> Result<i64> {
        Ok(self
            .get_document_update_interval_multiple(
                topology,
                &[(identifier_class, identifier_hash)],
            )
            .await?[0])
    }

    /// Average change intervals for a set of documents, in input order.
    pub async fn get_document_update_interval_multiple(
        &self,
        topology: &PipelineTopology,
        documents: &[(&str, &str)],
    ) -> Result<Vec<i64>> {
        let outputs = topology.unique_output_connection_names();
        let doc_keys = doc_keys_of(documents);
        let intervals = self.store.load_update_intervals(&outputs, &doc_keys).await?;
        Ok(doc_keys
            .iter()
            .map(|key| intervals.get(key).copied().unwrap_or(0))
            .collect())
    }

    /// The output was reconfigured: force reindex of everything it holds on
    /// the next pass, without forgetting what is there.
    pub async fn reset_output_connection(&self, output_connection: &str) -> Result<()> {
        Ok(self.store.reset_versions(output_connection).await?)
    }

    /// The output is going away: drop every record for it and let the
    /// connector clear its own state. A missing connector is not an error
    /// here; there is nothing left to clean up against.
    pub async fn remove_output_connection(&self, output_connection: &str) -> Result<()> {
        self.store.delete_by_output(output_connection).await?;

        let Some(connector) = self.output_pool.grab(output_connection).await? else {
            return Ok(());
        };
        let result = connector.note_all_records_removed().await;
        self.output_pool.release(output_connection, connector);
        result
    }

    async fn grab_pipeline(&self, topology: &PipelineTopology) -> Result<PipelineConnectors> {
        let mut connectors = PipelineConnectors::default();
        match self.try_grab_pipeline(topology, &mut connectors).await {
            Ok(()) => Ok(connectors),
            Err(e) => {
                // Whatever was grabbed before the failure goes back.
                self.release_pipeline(connectors);
                Err(e)
            },
        }
    }

    async fn try_grab_pipeline(
        &self,
        topology: &PipelineTopology,
        connectors: &mut PipelineConnectors,
    ) -> Result<()> {
        for name in topology.transformation_connection_names() {
            let Some(connector) = self.transformation_pool.grab(&name).await? else {
                return Err(IngestError::interruption(
                    "transformation connector not installed",
                ));
            };
            connectors.transformations.insert(name, connector);
        }
        for name in topology.unique_output_connection_names() {
            let Some(connector) = self.output_pool.grab(&name).await? else {
                return Err(IngestError::interruption("output connector not installed"));
            };
            connectors.outputs.insert(name, connector);
        }
        Ok(())
    }

    fn release_pipeline(&self, connectors: PipelineConnectors) {
        for (name, connector) in connectors.transformations {
            self.transformation_pool.release(&name, connector);
        }
        for (name, connector) in connectors.outputs {
            self.output_pool.release(&name, connector);
        }
    }
}

fn doc_keys_of(documents: &[(&str, &str)]) -> Vec<String> {
    documents
        .iter()
        .map(|(class, hash)| make_doc_key(class, hash))
        .collect()
}
