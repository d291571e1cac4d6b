//! Activity sinks
//!
//! Connectors report what they did (fetches, sends, removals) through an
//! activity sink owned by the caller. When a connector sits inside a
//! pipeline, its activity records must be attributed to the connection it
//! runs under; [`QualifiedActivitySink`] wraps the caller's sink and prefixes
//! the activity type with the connection name before delegating.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::document::Document;
use crate::error::Result;

/// Outcome of handing a document to a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    /// The stage took the document (or a downstream stage did).
    Accepted,
    /// The stage permanently refused the document; do not retry it.
    Rejected,
}

/// Time-stamped history recording, as made available to connectors.
#[async_trait]
pub trait HistoryActivity: Send + Sync {
    /// Record one activity event.
    ///
    /// `start_time` is ms since epoch, or `None` when the activity was
    /// instantaneous. `activity_type` is connector-defined. `result_code` is
    /// a terse machine-readable outcome; `result_description` adds detail.
    async fn record_activity(
        &self,
        start_time: Option<i64>,
        activity_type: &str,
        data_size: Option<u64>,
        entity_uri: Option<&str>,
        result_code: Option<&str>,
        result_description: Option<&str>,
    ) -> Result<()>;
}

/// Downstream probes available while deciding whether to fetch a document.
#[async_trait]
pub trait CheckActivity: Send + Sync {
    async fn check_mime_type(&self, mime_type: &str) -> Result<bool>;
    async fn check_file(&self, local_file: &Path) -> Result<bool>;
    async fn check_length(&self, length: u64) -> Result<bool>;
    async fn check_url(&self, url: &str) -> Result<bool>;
}

/// The capabilities a caller supplies to ingestion operations: terminal
/// check answers plus history recording. Everything implementing both gets
/// this for free.
pub trait IngestActivities: CheckActivity + HistoryActivity {}

impl<T: CheckActivity + HistoryActivity + ?Sized> IngestActivities for T {}

/// What a transformation connector may do with the document it produced:
/// probe downstream acceptability, forward the document, and log activity.
#[async_trait]
pub trait AddActivity: CheckActivity + HistoryActivity {
    /// Send a document onward to the next pipeline stage.
    ///
    /// `uri` is the document's URI in the downstream index space, or `None`
    /// when the connector wants the version recorded without indexing.
    async fn send_document(
        &self,
        uri: Option<&str>,
        document: Document,
        authority: &str,
    ) -> Result<DocumentStatus>;
}

/// Activity recording wrapped in connection-name attribution: one value
/// holding the qualifier and a delegate.
#[derive(Clone)]
pub struct QualifiedActivitySink {
    connection_name: String,
    delegate: Arc<dyn HistoryActivity>,
}

impl QualifiedActivitySink {
    pub fn new(connection_name: impl Into<String>, delegate: Arc<dyn HistoryActivity>) -> Self {
        QualifiedActivitySink {
            connection_name: connection_name.into(),
            delegate,
        }
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    fn qualify(&self, activity_type: &str) -> String {
        format!("{} ({})", activity_type, self.connection_name)
    }
}

#[async_trait]
impl HistoryActivity for QualifiedActivitySink {
    async fn record_activity(
        &self,
        start_time: Option<i64>,
        activity_type: &str,
        data_size: Option<u64>,
        entity_uri: Option<&str>,
        result_code: Option<&str>,
        result_description: Option<&str>,
    ) -> Result<()> {
        self.delegate
            .record_activity(
                start_time,
                &self.qualify(activity_type),
                data_size,
                entity_uri,
                result_code,
                result_description,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingActivity;

    #[tokio::test]
    async fn test_qualified_sink_prefixes_connection_name() {
        let inner = Arc::new(RecordingActivity::default());
        let sink = QualifiedActivitySink::new("solr-main", inner.clone());
        sink.record_activity(Some(1000), "document ingest", Some(42), Some("http://a"), Some("OK"), None)
            .await
            .unwrap();

        let events = inner.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].activity_type, "document ingest (solr-main)");
        assert_eq!(events[0].entity_uri.as_deref(), Some("http://a"));
    }
}
