//! Ingest record store
//!
//! One row per (output connection, document key): which URI currently holds
//! the document downstream and the version fingerprints it was last
//! delivered with. The table is the authoritative mirror of the downstream
//! indexes, so every mutation here is written to survive concurrent
//! ingestion, concurrent deletion, and deadlock aborts.
//!
//! The upsert never takes a table lock. Rows that do not exist yet cannot be
//! locked, so a lost race between two first-time writers is detected by the
//! unique (doc_key, output_connection) index instead: try the UPDATE under
//! `SELECT ... FOR UPDATE`, fall back to INSERT, and convert a
//! unique-violation on the INSERT into a restart that will find the
//! competing row and update it.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::db::{Clause, ColumnDef, DbError, DbInterface, DbTransaction, IndexDef, SqlValue};
use crate::retry::transient_backoff;
use crate::types::DocumentIngestStatus;

/// Default name of the backing table.
pub const DEFAULT_TABLE: &str = "ingeststatus";

const ID: &str = "id";
const OUTPUT_CONNECTION: &str = "output_connection";
const DOC_KEY: &str = "doc_key";
const DOC_URI: &str = "doc_uri";
const URI_HASH: &str = "uri_hash";
const LAST_VERSION: &str = "last_version";
const LAST_OUTPUT_VERSION: &str = "last_output_version";
const LAST_TRANSFORMATION_VERSION: &str = "last_transformation_version";
const FORCED_PARAMS: &str = "forced_params";
const CHANGE_COUNT: &str = "change_count";
const FIRST_INGEST: &str = "first_ingest";
const LAST_INGEST: &str = "last_ingest";
const AUTHORITY_NAME: &str = "authority_name";

/// URI-related state of one record, as needed before a delivery or removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UriState {
    pub uri: Option<String>,
    pub uri_hash: Option<String>,
    pub output_version: Option<String>,
}

/// URI and output version needed to remove a delivered document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteInfo {
    pub uri: Option<String>,
    pub output_version: Option<String>,
}

/// Version fields written by an upsert.
///
/// `None` version fields are written as SQL NULL (that is what a pre-ingest
/// placeholder looks like). A `None` URI leaves any previously recorded URI
/// columns untouched on update and inserts NULL on first insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFields<'a> {
    pub document_version: Option<&'a str>,
    pub transformation_version: Option<&'a str>,
    pub output_version: Option<&'a str>,
    pub parameter_version: Option<&'a str>,
    pub authority_name: Option<&'a str>,
    pub uri: Option<UriFields<'a>>,
}

/// A document URI plus its precomputed hash.
#[derive(Debug, Clone, Copy)]
pub struct UriFields<'a> {
    pub uri: &'a str,
    pub uri_hash: &'a str,
}

/// How an upsert landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A fresh row was created (`change_count` = 1).
    Inserted,
    /// An existing row was updated.
    Updated,
}

/// Fingerprint columns of one record, keyed for callers by document key and
/// output connection.
#[derive(Debug, Clone)]
pub struct IngestStatusRow {
    pub doc_key: String,
    pub output_connection: String,
    pub status: DocumentIngestStatus,
}

/// The persistent ingest-state table.
pub struct IngestRecordStore {
    db: Arc<dyn DbInterface>,
    table: String,
}

impl IngestRecordStore {
    pub fn new(db: Arc<dyn DbInterface>) -> Self {
        Self::with_table(db, DEFAULT_TABLE)
    }

    pub fn with_table(db: Arc<dyn DbInterface>, table: impl Into<String>) -> Self {
        IngestRecordStore {
            db,
            table: table.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn target_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new(ID, "BIGINT", true, false),
            ColumnDef::new(OUTPUT_CONNECTION, "VARCHAR(32)", false, false),
            ColumnDef::new(DOC_KEY, "VARCHAR(73)", false, false),
            // NULL doc_uri means the version was recorded but nothing was
            // actually delivered to the index.
            ColumnDef::new(DOC_URI, "TEXT", false, true),
            ColumnDef::new(URI_HASH, "VARCHAR(40)", false, true),
            ColumnDef::new(LAST_VERSION, "TEXT", false, true),
            ColumnDef::new(LAST_OUTPUT_VERSION, "TEXT", false, true),
            ColumnDef::new(LAST_TRANSFORMATION_VERSION, "TEXT", false, true),
            ColumnDef::new(FORCED_PARAMS, "TEXT", false, true),
            ColumnDef::new(CHANGE_COUNT, "BIGINT", false, false),
            ColumnDef::new(FIRST_INGEST, "BIGINT", false, false),
            ColumnDef::new(LAST_INGEST, "BIGINT", false, false),
            ColumnDef::new(AUTHORITY_NAME, "VARCHAR(32)", false, true),
        ]
    }

    fn target_indexes() -> Vec<IndexDef> {
        vec![
            IndexDef::new(true, &[DOC_KEY, OUTPUT_CONNECTION]),
            IndexDef::new(false, &[URI_HASH, OUTPUT_CONNECTION]),
            IndexDef::new(false, &[OUTPUT_CONNECTION]),
        ]
    }

    /// Reconcile the backing table with the target schema: create it if
    /// absent, add any missing columns, drop secondary indexes that are not
    /// in the target list, and create the ones that are missing. Safe to run
    /// on every startup.
    pub async fn install(&self) -> Result<(), DbError> {
        let target = Self::target_columns();
        match self.db.table_schema(&self.table).await? {
            None => {
                self.db.perform_create(&self.table, &target).await?;
            },
            Some(existing) => {
                let present: HashSet<&str> =
                    existing.iter().map(|c| c.name.as_str()).collect();
                let missing: Vec<ColumnDef> = target
                    .iter()
                    .filter(|c| !present.contains(c.name.as_str()))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    self.db.perform_add_columns(&self.table, &missing).await?;
                }
            },
        }

        let mut wanted = Self::target_indexes();
        for (name, existing) in self.db.table_indexes(&self.table).await? {
            if let Some(position) = wanted.iter().position(|w| *w == existing) {
                wanted.remove(position);
            } else {
                self.db.perform_remove_index(&self.table, &name).await?;
            }
        }
        for index in &wanted {
            self.db.perform_add_index(&self.table, index).await?;
        }
        Ok(())
    }

    /// Drop the backing table.
    pub async fn deinstall(&self) -> Result<(), DbError> {
        self.db.perform_drop(&self.table).await
    }

    /// Forget everything that was ever ingested, for every output.
    pub async fn clear_all(&self) -> Result<(), DbError> {
        let mut tx = self.db.begin().await?;
        tx.delete(&self.table, &[]).await?;
        tx.commit().await
    }

    /// Current URI state for one (output, document). Deadlock aborts are
    /// retried here so callers see only settled answers.
    pub async fn find_uri_state(
        &self,
        output_connection: &str,
        doc_key: &str,
    ) -> Result<UriState, DbError> {
        let mut attempt = 0u32;
        loop {
            match self.try_find_uri_state(output_connection, doc_key).await {
                Ok(state) => return Ok(state),
                Err(e) if e.is_transaction_abort() => {
                    debug!(error = %e, doc_key, "aborted select looking for ingest status, retrying");
                    transient_backoff(attempt).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_find_uri_state(
        &self,
        output_connection: &str,
        doc_key: &str,
    ) -> Result<UriState, DbError> {
        let mut tx = self.db.begin().await?;
        let rows = tx
            .query(
                &self.table,
                &[DOC_URI, URI_HASH, LAST_OUTPUT_VERSION],
                &[
                    Clause::Eq(DOC_KEY, doc_key.into()),
                    Clause::Eq(OUTPUT_CONNECTION, output_connection.into()),
                ],
                false,
            )
            .await?;
        tx.commit().await?;
        let Some(row) = rows.first() else {
            return Ok(UriState::default());
        };
        Ok(UriState {
            uri: row.opt_text(DOC_URI)?.map(str::to_string),
            uri_hash: row.opt_text(URI_HASH)?.map(str::to_string),
            output_version: row.opt_text(LAST_OUTPUT_VERSION)?.map(str::to_string),
        })
    }

    /// URIs currently held by a set of documents at one output, chunked into
    /// one transaction. Documents without a row are absent from the result;
    /// empty-string URIs are treated as never delivered.
    pub async fn find_delete_infos(
        &self,
        output_connection: &str,
        doc_keys: &[String],
    ) -> Result<HashMap<String, DeleteInfo>, DbError> {
        let fixed = [Clause::Eq(OUTPUT_CONNECTION, output_connection.into())];
        let max = self.db.conjunction_clause_max(&fixed);
        let unique_keys: Vec<String> = dedup(doc_keys);

        let mut result = HashMap::new();
        let mut tx = self.db.begin().await?;
        for chunk in unique_keys.chunks(max) {
            let rows = tx
                .query(
                    &self.table,
                    &[DOC_KEY, DOC_URI, LAST_OUTPUT_VERSION],
                    &[
                        Clause::In(DOC_KEY, text_values(chunk)),
                        Clause::Eq(OUTPUT_CONNECTION, output_connection.into()),
                    ],
                    false,
                )
                .await?;
            for row in rows {
                let uri = row
                    .opt_text(DOC_URI)?
                    .filter(|u| !u.is_empty())
                    .map(str::to_string);
                result.insert(
                    row.get_text(DOC_KEY)?.to_string(),
                    DeleteInfo {
                        uri,
                        output_version: row.opt_text(LAST_OUTPUT_VERSION)?.map(str::to_string),
                    },
                );
            }
        }
        tx.commit().await?;
        Ok(result)
    }

    /// Record an ingestion (or version check) for one (output, document).
    ///
    /// Loops until exactly one of update/insert lands: deadlocks back off
    /// and restart, a unique violation on the insert means someone else won
    /// the first-insert race and the restart will update their row instead.
    ///
    /// `count_event` says whether this write is an ingestion event: when
    /// set, an update increments `change_count`. The pre-ingest placeholder
    /// passes `false` so a delivery counts once, not once for the
    /// placeholder and once for the fingerprints. Inserts always start at 1.
    pub async fn upsert_record(
        &self,
        output_connection: &str,
        doc_key: &str,
        fields: &RecordFields<'_>,
        ingest_time: i64,
        count_event: bool,
    ) -> Result<UpsertOutcome, DbError> {
        let mut attempt = 0u32;
        loop {
            match self
                .try_update_record(output_connection, doc_key, fields, ingest_time, count_event)
                .await
            {
                Ok(true) => return Ok(UpsertOutcome::Updated),
                Ok(false) => {
                    // No row yet; fall through to the insert attempt.
                },
                Err(e) if e.is_transaction_abort() => {
                    debug!(error = %e, doc_key, "aborted transaction noting ingestion, retrying");
                    transient_backoff(attempt).await;
                    attempt += 1;
                    continue;
                },
                Err(e) => return Err(e),
            }

            match self
                .try_insert_record(output_connection, doc_key, fields, ingest_time)
                .await
            {
                Ok(()) => return Ok(UpsertOutcome::Inserted),
                Err(e) if e.is_unique_violation() => {
                    debug!(doc_key, output_connection, "lost first-insert race, updating instead");
                    continue;
                },
                Err(e) if e.is_transaction_abort() => {
                    transient_backoff(attempt).await;
                    attempt += 1;
                    continue;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_update_record(
        &self,
        output_connection: &str,
        doc_key: &str,
        fields: &RecordFields<'_>,
        ingest_time: i64,
        count_event: bool,
    ) -> Result<bool, DbError> {
        let mut tx = self.db.begin().await?;
        let rows = tx
            .query(
                &self.table,
                &[ID, CHANGE_COUNT],
                &[
                    Clause::Eq(DOC_KEY, doc_key.into()),
                    Clause::Eq(OUTPUT_CONNECTION, output_connection.into()),
                ],
                true,
            )
            .await?;
        let Some(row) = rows.first() else {
            tx.rollback().await?;
            return Ok(false);
        };
        let id = row.get_i64(ID)?;
        let change_count = row.get_i64(CHANGE_COUNT)?;

        let mut set = version_fields(fields, ingest_time);
        if count_event {
            set.push((CHANGE_COUNT, (change_count + 1).into()));
        }
        tx.update(&self.table, &set, &[Clause::Eq(ID, id.into())])
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn try_insert_record(
        &self,
        output_connection: &str,
        doc_key: &str,
        fields: &RecordFields<'_>,
        ingest_time: i64,
    ) -> Result<(), DbError> {
        let mut values = version_fields(fields, ingest_time);
        values.push((ID, fresh_id().into()));
        values.push((OUTPUT_CONNECTION, output_connection.into()));
        values.push((DOC_KEY, doc_key.into()));
        values.push((CHANGE_COUNT, 1i64.into()));
        values.push((FIRST_INGEST, ingest_time.into()));

        let mut tx = self.db.begin().await?;
        tx.insert(&self.table, &values).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete every record sharing `uri_hash` at this output except the one
    /// belonging to `keep_doc_key`. Run before a URI is (re)assigned, so the
    /// table never claims two documents occupy one URI.
    pub async fn delete_other_rows_with_uri_hash(
        &self,
        output_connection: &str,
        uri_hash: &str,
        keep_doc_key: &str,
    ) -> Result<u64, DbError> {
        let mut tx = self.db.begin().await?;
        let removed = tx
            .delete(
                &self.table,
                &[
                    Clause::Eq(URI_HASH, uri_hash.into()),
                    Clause::Eq(OUTPUT_CONNECTION, output_connection.into()),
                    Clause::Ne(DOC_KEY, keep_doc_key.into()),
                ],
            )
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Note that a set of documents was checked and found current: bump
    /// `last_ingest` without touching anything else. One transaction.
    pub async fn update_last_ingest(
        &self,
        output_connections: &[String],
        doc_keys: &[String],
        check_time: i64,
    ) -> Result<(), DbError> {
        let mut tx = self.db.begin().await?;
        let ids = self
            .find_row_ids_by_doc_keys(tx.as_mut(), output_connections, doc_keys)
            .await?;

        let max = self.db.conjunction_clause_max(&[]);
        let ids: Vec<i64> = ids.into_iter().collect();
        for chunk in ids.chunks(max) {
            tx.update(
                &self.table,
                &[(LAST_INGEST, check_time.into())],
                &[Clause::In(ID, int_values(chunk))],
            )
            .await?;
        }
        tx.commit().await
    }

    /// Remove all rows for a set of documents at one output: rows occupying
    /// any of the given URIs (verified against the full URI to defeat hash
    /// collisions) and rows keyed by the documents themselves. One
    /// transaction; the caller has already removed the documents downstream.
    pub async fn delete_rows_for(
        &self,
        output_connection: &str,
        uris: &HashSet<String>,
        doc_keys: &[String],
    ) -> Result<(), DbError> {
        let uri_hashes: Vec<String> =
            dedup(&uris.iter().map(|u| dcp_common::hash::uri_hash(u)).collect::<Vec<_>>());

        let mut tx = self.db.begin().await?;

        let mut row_ids = self
            .find_row_ids_by_uri_hashes(tx.as_mut(), output_connection, &uri_hashes, uris)
            .await?;
        self.delete_by_ids(tx.as_mut(), &mut row_ids).await?;

        let outputs = [output_connection.to_string()];
        let mut row_ids = self
            .find_row_ids_by_doc_keys(tx.as_mut(), &outputs, doc_keys)
            .await?;
        self.delete_by_ids(tx.as_mut(), &mut row_ids).await?;

        tx.commit().await
    }

    async fn find_row_ids_by_doc_keys(
        &self,
        tx: &mut dyn DbTransaction,
        output_connections: &[String],
        doc_keys: &[String],
    ) -> Result<HashSet<i64>, DbError> {
        let fixed = [Clause::In(OUTPUT_CONNECTION, text_values(output_connections))];
        let max = self.db.conjunction_clause_max(&fixed);
        let unique_keys = dedup(doc_keys);

        let mut ids = HashSet::new();
        for chunk in unique_keys.chunks(max) {
            let rows = tx
                .query(
                    &self.table,
                    &[ID],
                    &[
                        Clause::In(DOC_KEY, text_values(chunk)),
                        Clause::In(OUTPUT_CONNECTION, text_values(output_connections)),
                    ],
                    false,
                )
                .await?;
            for row in rows {
                ids.insert(row.get_i64(ID)?);
            }
        }
        Ok(ids)
    }

    /// Hash search narrowed by exact URI equality: two URIs may share a
    /// hash, and deleting by hash alone would strand the other document.
    async fn find_row_ids_by_uri_hashes(
        &self,
        tx: &mut dyn DbTransaction,
        output_connection: &str,
        uri_hashes: &[String],
        full_uris: &HashSet<String>,
    ) -> Result<HashSet<i64>, DbError> {
        let fixed = [Clause::Eq(OUTPUT_CONNECTION, output_connection.into())];
        let max = self.db.conjunction_clause_max(&fixed);

        let mut ids = HashSet::new();
        for chunk in uri_hashes.chunks(max) {
            let rows = tx
                .query(
                    &self.table,
                    &[ID, DOC_URI],
                    &[
                        Clause::In(URI_HASH, text_values(chunk)),
                        Clause::Eq(OUTPUT_CONNECTION, output_connection.into()),
                    ],
                    false,
                )
                .await?;
            for row in rows {
                if let Some(uri) = row.opt_text(DOC_URI)? {
                    if !uri.is_empty() && full_uris.contains(uri) {
                        ids.insert(row.get_i64(ID)?);
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn delete_by_ids(
        &self,
        tx: &mut dyn DbTransaction,
        ids: &mut HashSet<i64>,
    ) -> Result<(), DbError> {
        let max = self.db.conjunction_clause_max(&[]);
        let ids: Vec<i64> = ids.drain().collect();
        for chunk in ids.chunks(max) {
            tx.delete(&self.table, &[Clause::In(ID, int_values(chunk))])
                .await?;
        }
        Ok(())
    }

    /// Stored fingerprints for a set of documents across a set of outputs.
    /// Documents with no row are simply absent. NULL columns come back as
    /// empty strings.
    pub async fn load_ingest_statuses(
        &self,
        output_connections: &[String],
        doc_keys: &[String],
    ) -> Result<Vec<IngestStatusRow>, DbError> {
        let fixed = [Clause::In(OUTPUT_CONNECTION, text_values(output_connections))];
        let max = self.db.conjunction_clause_max(&fixed);
        let unique_keys = dedup(doc_keys);

        let mut result = Vec::new();
        let mut tx = self.db.begin().await?;
        for chunk in unique_keys.chunks(max) {
            let rows = tx
                .query(
                    &self.table,
                    &[
                        DOC_KEY,
                        OUTPUT_CONNECTION,
                        LAST_VERSION,
                        LAST_TRANSFORMATION_VERSION,
                        LAST_OUTPUT_VERSION,
                        FORCED_PARAMS,
                        AUTHORITY_NAME,
                    ],
                    &[
                        Clause::In(DOC_KEY, text_values(chunk)),
                        Clause::In(OUTPUT_CONNECTION, text_values(output_connections)),
                    ],
                    false,
                )
                .await?;
            for row in rows {
                result.push(IngestStatusRow {
                    doc_key: row.get_text(DOC_KEY)?.to_string(),
                    output_connection: row.get_text(OUTPUT_CONNECTION)?.to_string(),
                    status: DocumentIngestStatus {
                        document_version: opt_or_empty(&row, LAST_VERSION)?,
                        transformation_version: opt_or_empty(&row, LAST_TRANSFORMATION_VERSION)?,
                        output_version: opt_or_empty(&row, LAST_OUTPUT_VERSION)?,
                        parameter_version: opt_or_empty(&row, FORCED_PARAMS)?,
                        authority_name: opt_or_empty(&row, AUTHORITY_NAME)?,
                    },
                });
            }
        }
        tx.commit().await?;
        Ok(result)
    }

    /// Minimum observed update interval per document across the given
    /// outputs: `(last_ingest - first_ingest) / change_count`, in ms.
    /// Documents with no rows are absent from the result.
    pub async fn load_update_intervals(
        &self,
        output_connections: &[String],
        doc_keys: &[String],
    ) -> Result<HashMap<String, i64>, DbError> {
        let fixed = [Clause::In(OUTPUT_CONNECTION, text_values(output_connections))];
        let max = self.db.conjunction_clause_max(&fixed);
        let unique_keys = dedup(doc_keys);

        let mut result: HashMap<String, i64> = HashMap::new();
        let mut tx = self.db.begin().await?;
        for chunk in unique_keys.chunks(max) {
            let rows = tx
                .query(
                    &self.table,
                    &[DOC_KEY, CHANGE_COUNT, FIRST_INGEST, LAST_INGEST],
                    &[
                        Clause::In(DOC_KEY, text_values(chunk)),
                        Clause::In(OUTPUT_CONNECTION, text_values(output_connections)),
                    ],
                    false,
                )
                .await?;
            for row in rows {
                let change_count = row.get_i64(CHANGE_COUNT)?;
                let first = row.get_i64(FIRST_INGEST)?;
                let last = row.get_i64(LAST_INGEST)?;
                let interval = ((last - first) as f64 / change_count as f64) as i64;
                result
                    .entry(row.get_text(DOC_KEY)?.to_string())
                    .and_modify(|current| *current = (*current).min(interval))
                    .or_insert(interval);
            }
        }
        tx.commit().await?;
        Ok(result)
    }

    /// Mark every record of an output as needing reindex: the version goes
    /// to NULL, the rows stay.
    pub async fn reset_versions(&self, output_connection: &str) -> Result<(), DbError> {
        let mut tx = self.db.begin().await?;
        tx.update(
            &self.table,
            &[(LAST_VERSION, SqlValue::Null)],
            &[Clause::Eq(OUTPUT_CONNECTION, output_connection.into())],
        )
        .await?;
        tx.commit().await
    }

    /// Drop every record of an output.
    pub async fn delete_by_output(&self, output_connection: &str) -> Result<(), DbError> {
        let mut tx = self.db.begin().await?;
        tx.delete(
            &self.table,
            &[Clause::Eq(OUTPUT_CONNECTION, output_connection.into())],
        )
        .await?;
        tx.commit().await
    }
}

fn version_fields(fields: &RecordFields<'_>, ingest_time: i64) -> Vec<(&'static str, SqlValue)> {
    let mut set = vec![
        (LAST_VERSION, SqlValue::opt_text(fields.document_version)),
        (
            LAST_TRANSFORMATION_VERSION,
            SqlValue::opt_text(fields.transformation_version),
        ),
        (LAST_OUTPUT_VERSION, SqlValue::opt_text(fields.output_version)),
        (FORCED_PARAMS, SqlValue::opt_text(fields.parameter_version)),
        (LAST_INGEST, ingest_time.into()),
        // Authority absence is stored as the empty string, never NULL.
        (
            AUTHORITY_NAME,
            SqlValue::Text(fields.authority_name.unwrap_or("").to_string()),
        ),
    ];
    if let Some(uri) = &fields.uri {
        set.push((DOC_URI, uri.uri.into()));
        set.push((URI_HASH, uri.uri_hash.into()));
    }
    set
}

fn fresh_id() -> i64 {
    rand::rng().random_range(1..i64::MAX)
}

fn dedup(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter(|v| seen.insert(v.as_str()))
        .cloned()
        .collect()
}

fn text_values(values: &[String]) -> Vec<SqlValue> {
    values.iter().map(|v| SqlValue::Text(v.clone())).collect()
}

fn int_values(values: &[i64]) -> Vec<SqlValue> {
    values.iter().map(|v| SqlValue::BigInt(*v)).collect()
}

fn opt_or_empty(row: &crate::db::SqlRow, column: &str) -> Result<String, DbError> {
    Ok(row.opt_text(column)?.unwrap_or("").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemDatabase;
    use async_trait::async_trait;
    use dcp_common::hash::uri_hash;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn installed_store() -> (Arc<MemDatabase>, IngestRecordStore) {
        let db = Arc::new(MemDatabase::new());
        let store = IngestRecordStore::new(db.clone());
        store.install().await.unwrap();
        (db, store)
    }

    fn full_fields<'a>(version: &'a str, uri: Option<UriFields<'a>>) -> RecordFields<'a> {
        RecordFields {
            document_version: Some(version),
            transformation_version: Some("tv"),
            output_version: Some("ov"),
            parameter_version: Some("pv"),
            authority_name: Some("auth"),
            uri,
        }
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let (db, store) = installed_store().await;
        store.install().await.unwrap();
        let indexes = db.table_indexes(DEFAULT_TABLE).await.unwrap();
        assert_eq!(indexes.len(), 3);
        assert_eq!(indexes.values().filter(|i| i.unique).count(), 1);
    }

    #[tokio::test]
    async fn test_install_adds_missing_columns_and_prunes_indexes() {
        let db = Arc::new(MemDatabase::new());
        // A v-minus-one schema: no forced_params, plus a stray index.
        let mut columns = IngestRecordStore::target_columns();
        columns.retain(|c| c.name != FORCED_PARAMS);
        db.perform_create(DEFAULT_TABLE, &columns).await.unwrap();
        db.perform_add_index(DEFAULT_TABLE, &IndexDef::new(false, &[LAST_INGEST]))
            .await
            .unwrap();

        let store = IngestRecordStore::new(db.clone());
        store.install().await.unwrap();

        let schema = db.table_schema(DEFAULT_TABLE).await.unwrap().unwrap();
        assert!(schema.iter().any(|c| c.name == FORCED_PARAMS));
        let indexes = db.table_indexes(DEFAULT_TABLE).await.unwrap();
        assert_eq!(indexes.len(), 3);
        assert!(!indexes
            .values()
            .any(|i| i.columns == vec![LAST_INGEST.to_string()]));
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let (db, store) = installed_store().await;
        let hash = uri_hash("http://a");
        let uri = UriFields {
            uri: "http://a",
            uri_hash: &hash,
        };

        store
            .upsert_record("web", "web:h1", &full_fields("v1", Some(uri)), 1000, true)
            .await
            .unwrap();
        store
            .upsert_record("web", "web:h1", &full_fields("v2", Some(uri)), 1500, true)
            .await
            .unwrap();

        let rows = db.snapshot_rows(DEFAULT_TABLE);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row[LAST_VERSION], SqlValue::Text("v2".into()));
        assert_eq!(row[CHANGE_COUNT], SqlValue::BigInt(2));
        assert_eq!(row[FIRST_INGEST], SqlValue::BigInt(1000));
        assert_eq!(row[LAST_INGEST], SqlValue::BigInt(1500));
        assert_eq!(row[AUTHORITY_NAME], SqlValue::Text("auth".into()));
    }

    #[tokio::test]
    async fn test_placeholder_then_fingerprints() {
        let (db, store) = installed_store().await;
        let hash = uri_hash("http://a");
        let uri = UriFields {
            uri: "http://a",
            uri_hash: &hash,
        };

        // Pre-ingest placeholder: URI recorded, versions unknown.
        let placeholder = RecordFields {
            uri: Some(uri),
            ..RecordFields::default()
        };
        store
            .upsert_record("web", "web:h1", &placeholder, 1000, false)
            .await
            .unwrap();
        {
            let rows = db.snapshot_rows(DEFAULT_TABLE);
            assert_eq!(rows[0][LAST_VERSION], SqlValue::Null);
            assert_eq!(rows[0][DOC_URI], SqlValue::Text("http://a".into()));
        }

        store
            .upsert_record("web", "web:h1", &full_fields("v1", Some(uri)), 1000, true)
            .await
            .unwrap();
        let rows = db.snapshot_rows(DEFAULT_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][LAST_VERSION], SqlValue::Text("v1".into()));
        assert_eq!(rows[0][CHANGE_COUNT], SqlValue::BigInt(2));
    }

    #[tokio::test]
    async fn test_record_only_upsert_leaves_uri_columns_alone() {
        let (db, store) = installed_store().await;
        let hash = uri_hash("http://a");
        let uri = UriFields {
            uri: "http://a",
            uri_hash: &hash,
        };
        store
            .upsert_record("web", "web:h1", &full_fields("v1", Some(uri)), 1000, true)
            .await
            .unwrap();
        store
            .upsert_record("web", "web:h1", &full_fields("v2", None), 2000, true)
            .await
            .unwrap();

        let rows = db.snapshot_rows(DEFAULT_TABLE);
        assert_eq!(rows[0][DOC_URI], SqlValue::Text("http://a".into()));
        assert_eq!(rows[0][LAST_VERSION], SqlValue::Text("v2".into()));
    }

    #[tokio::test]
    async fn test_reset_versions_scoped_to_output() {
        let (db, store) = installed_store().await;
        store
            .upsert_record("web", "web:h1", &full_fields("v1", None), 1000, true)
            .await
            .unwrap();
        store
            .upsert_record("file", "web:h1", &full_fields("v1", None), 1000, true)
            .await
            .unwrap();

        store.reset_versions("web").await.unwrap();

        for row in db.snapshot_rows(DEFAULT_TABLE) {
            match &row[OUTPUT_CONNECTION] {
                SqlValue::Text(output) if output == "web" => {
                    assert_eq!(row[LAST_VERSION], SqlValue::Null);
                },
                _ => assert_eq!(row[LAST_VERSION], SqlValue::Text("v1".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_update_last_ingest_chunks() {
        // Budget of 4 with one fixed output clause leaves 3 per chunk.
        let db = Arc::new(MemDatabase::with_max_conjunction_params(4));
        let store = IngestRecordStore::new(db.clone());
        store.install().await.unwrap();

        let keys: Vec<String> = (0..7).map(|i| format!("web:h{i}")).collect();
        for key in &keys {
            store
                .upsert_record("web", key, &full_fields("v1", None), 1000, true)
                .await
                .unwrap();
        }
        store
            .update_last_ingest(&["web".to_string()], &keys, 2000)
            .await
            .unwrap();

        for row in db.snapshot_rows(DEFAULT_TABLE) {
            assert_eq!(row[LAST_INGEST], SqlValue::BigInt(2000));
            assert_eq!(row[FIRST_INGEST], SqlValue::BigInt(1000));
            assert_eq!(row[CHANGE_COUNT], SqlValue::BigInt(1));
        }
    }

    #[tokio::test]
    async fn test_delete_rows_for_checks_exact_uri_on_hash_match() {
        let (db, store) = installed_store().await;
        store
            .upsert_record(
                "web",
                "web:h1",
                &full_fields(
                    "v1",
                    Some(UriFields {
                        uri: "http://a",
                        uri_hash: &uri_hash("http://a"),
                    }),
                ),
                1000,
                true,
            )
            .await
            .unwrap();
        // A fabricated collision: same stored hash, different URI.
        store
            .upsert_record(
                "web",
                "web:h2",
                &full_fields(
                    "v1",
                    Some(UriFields {
                        uri: "http://other",
                        uri_hash: &uri_hash("http://a"),
                    }),
                ),
                1000,
                true,
            )
            .await
            .unwrap();

        let uris: HashSet<String> = ["http://a".to_string()].into();
        store
            .delete_rows_for("web", &uris, &["web:h1".to_string()])
            .await
            .unwrap();

        let rows = db.snapshot_rows(DEFAULT_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][DOC_KEY], SqlValue::Text("web:h2".into()));
    }

    #[tokio::test]
    async fn test_load_ingest_statuses_maps_nulls_to_empty() {
        let (_db, store) = installed_store().await;
        let placeholder = RecordFields {
            uri: Some(UriFields {
                uri: "http://a",
                uri_hash: &uri_hash("http://a"),
            }),
            ..RecordFields::default()
        };
        store
            .upsert_record("web", "web:h1", &placeholder, 1000, false)
            .await
            .unwrap();

        let statuses = store
            .load_ingest_statuses(&["web".to_string()], &["web:h1".to_string()])
            .await
            .unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status.document_version, "");
        assert_eq!(statuses[0].status.authority_name, "");
    }

    #[tokio::test]
    async fn test_load_update_intervals_takes_minimum_across_outputs() {
        let (_db, store) = installed_store().await;
        // web: (3000-1000)/2 = 1000; file: (1500-1000)/1 = 500.
        store
            .upsert_record("web", "web:h1", &full_fields("v1", None), 1000, true)
            .await
            .unwrap();
        store
            .upsert_record("web", "web:h1", &full_fields("v2", None), 3000, true)
            .await
            .unwrap();
        store
            .upsert_record("file", "web:h1", &full_fields("v1", None), 1000, true)
            .await
            .unwrap();
        let mut tx = store.db.begin().await.unwrap();
        tx.update(
            DEFAULT_TABLE,
            &[(LAST_INGEST, 1500i64.into())],
            &[
                Clause::Eq(OUTPUT_CONNECTION, "file".into()),
                Clause::Eq(DOC_KEY, "web:h1".into()),
            ],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let intervals = store
            .load_update_intervals(
                &["web".to_string(), "file".to_string()],
                &["web:h1".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(intervals["web:h1"], 500);
    }

    /// Wraps the memory backend and injects contention: a budget of FOR
    /// UPDATE reads that abort as if deadlocked, and a budget of "lost
    /// insert races" where a competitor's row commits just before our
    /// insert transaction begins, so the insert hits the real unique index.
    struct FlakyDb {
        inner: Arc<MemDatabase>,
        select_aborts: AtomicU32,
        insert_races: AtomicU32,
    }

    struct FlakyTx {
        inner: Box<dyn DbTransaction>,
        abort_next_locked_read: bool,
    }

    impl FlakyDb {
        fn new(inner: Arc<MemDatabase>, select_aborts: u32, insert_races: u32) -> Self {
            FlakyDb {
                inner,
                select_aborts: AtomicU32::new(select_aborts),
                insert_races: AtomicU32::new(insert_races),
            }
        }

        fn take(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl DbTransaction for FlakyTx {
        async fn query(
            &mut self,
            table: &str,
            columns: &[&str],
            clauses: &[Clause],
            for_update: bool,
        ) -> Result<Vec<crate::db::SqlRow>, DbError> {
            if for_update && self.abort_next_locked_read {
                self.abort_next_locked_read = false;
                return Err(DbError::TransactionAbort("injected deadlock".into()));
            }
            self.inner.query(table, columns, clauses, for_update).await
        }

        async fn insert(
            &mut self,
            table: &str,
            values: &[(&'static str, SqlValue)],
        ) -> Result<(), DbError> {
            self.inner.insert(table, values).await
        }

        async fn update(
            &mut self,
            table: &str,
            set: &[(&'static str, SqlValue)],
            clauses: &[Clause],
        ) -> Result<u64, DbError> {
            self.inner.update(table, set, clauses).await
        }

        async fn delete(&mut self, table: &str, clauses: &[Clause]) -> Result<u64, DbError> {
            self.inner.delete(table, clauses).await
        }

        async fn commit(self: Box<Self>) -> Result<(), DbError> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), DbError> {
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl DbInterface for FlakyDb {
        async fn table_schema(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, DbError> {
            self.inner.table_schema(table).await
        }
        async fn table_indexes(
            &self,
            table: &str,
        ) -> Result<HashMap<String, IndexDef>, DbError> {
            self.inner.table_indexes(table).await
        }
        async fn perform_create(
            &self,
            table: &str,
            columns: &[ColumnDef],
        ) -> Result<(), DbError> {
            self.inner.perform_create(table, columns).await
        }
        async fn perform_add_columns(
            &self,
            table: &str,
            columns: &[ColumnDef],
        ) -> Result<(), DbError> {
            self.inner.perform_add_columns(table, columns).await
        }
        async fn perform_drop(&self, table: &str) -> Result<(), DbError> {
            self.inner.perform_drop(table).await
        }
        async fn perform_add_index(&self, table: &str, index: &IndexDef) -> Result<(), DbError> {
            self.inner.perform_add_index(table, index).await
        }
        async fn perform_remove_index(
            &self,
            table: &str,
            index_name: &str,
        ) -> Result<(), DbError> {
            self.inner.perform_remove_index(table, index_name).await
        }
        fn conjunction_clause_max(&self, fixed: &[Clause]) -> usize {
            self.inner.conjunction_clause_max(fixed)
        }
        async fn begin(&self) -> Result<Box<dyn DbTransaction>, DbError> {
            if Self::take(&self.insert_races) {
                // The competitor commits between our update attempt and our
                // insert attempt.
                let mut competitor = self.inner.begin().await?;
                competitor
                    .insert(
                        DEFAULT_TABLE,
                        &[
                            (ID, SqlValue::BigInt(999_999)),
                            (OUTPUT_CONNECTION, "web".into()),
                            (DOC_KEY, "web:h1".into()),
                            (LAST_VERSION, "competitor".into()),
                            (AUTHORITY_NAME, "".into()),
                            (CHANGE_COUNT, 1i64.into()),
                            (FIRST_INGEST, 500i64.into()),
                            (LAST_INGEST, 500i64.into()),
                        ],
                    )
                    .await?;
                competitor.commit().await?;
            }
            Ok(Box::new(FlakyTx {
                inner: self.inner.begin().await?,
                abort_next_locked_read: Self::take(&self.select_aborts),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_retries_injected_deadlock() {
        let mem = Arc::new(MemDatabase::new());
        IngestRecordStore::new(mem.clone()).install().await.unwrap();

        let flaky = Arc::new(FlakyDb::new(mem.clone(), 1, 0));
        let store = IngestRecordStore::new(flaky);
        store
            .upsert_record("web", "web:h1", &full_fields("v1", None), 1000, true)
            .await
            .unwrap();
        assert_eq!(mem.snapshot_rows(DEFAULT_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_survives_lost_insert_race() {
        let mem = Arc::new(MemDatabase::new());
        IngestRecordStore::new(mem.clone()).install().await.unwrap();

        // First begin is the update attempt (finds nothing); the race is
        // armed for the second begin, so our insert collides and the
        // restart updates the competitor's row.
        let flaky = Arc::new(FlakyDb::new(mem.clone(), 0, 0));
        let racing = Arc::new(RaceOnSecondBegin {
            inner: flaky,
            begins_seen: AtomicU32::new(0),
        });
        let store = IngestRecordStore::new(racing);
        store
            .upsert_record("web", "web:h1", &full_fields("v1", None), 1000, true)
            .await
            .unwrap();

        // Exactly one surviving row: the competitor's, updated in place.
        let rows = mem.snapshot_rows(DEFAULT_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][ID], SqlValue::BigInt(999_999));
        assert_eq!(rows[0][LAST_VERSION], SqlValue::Text("v1".into()));
        assert_eq!(rows[0][CHANGE_COUNT], SqlValue::BigInt(2));
    }

    /// Arms the wrapped FlakyDb's insert race right before its second begin.
    struct RaceOnSecondBegin {
        inner: Arc<FlakyDb>,
        begins_seen: AtomicU32,
    }

    #[async_trait]
    impl DbInterface for RaceOnSecondBegin {
        async fn table_schema(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, DbError> {
            self.inner.table_schema(table).await
        }
        async fn table_indexes(
            &self,
            table: &str,
        ) -> Result<HashMap<String, IndexDef>, DbError> {
            self.inner.table_indexes(table).await
        }
        async fn perform_create(
            &self,
            table: &str,
            columns: &[ColumnDef],
        ) -> Result<(), DbError> {
            self.inner.perform_create(table, columns).await
        }
        async fn perform_add_columns(
            &self,
            table: &str,
            columns: &[ColumnDef],
        ) -> Result<(), DbError> {
            self.inner.perform_add_columns(table, columns).await
        }
        async fn perform_drop(&self, table: &str) -> Result<(), DbError> {
            self.inner.perform_drop(table).await
        }
        async fn perform_add_index(&self, table: &str, index: &IndexDef) -> Result<(), DbError> {
            self.inner.perform_add_index(table, index).await
        }
        async fn perform_remove_index(
            &self,
            table: &str,
            index_name: &str,
        ) -> Result<(), DbError> {
            self.inner.perform_remove_index(table, index_name).await
        }
        fn conjunction_clause_max(&self, fixed: &[Clause]) -> usize {
            self.inner.conjunction_clause_max(fixed)
        }
        async fn begin(&self) -> Result<Box<dyn DbTransaction>, DbError> {
            if self.begins_seen.fetch_add(1, Ordering::SeqCst) == 1 {
                self.inner.insert_races.store(1, Ordering::SeqCst);
            }
            self.inner.begin().await
        }
    }
}
