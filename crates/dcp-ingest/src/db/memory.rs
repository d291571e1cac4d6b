//! In-memory backend
//!
//! Backs the test suite and embedded deployments with the same interface as
//! Postgres. Transactions are serialized through an async gate (one writer at
//! a time) and roll back by restoring a snapshot taken at `begin`. Unique
//! indexes declared at install time are enforced on every insert and update,
//! so the record store's constraint-violation handling is exercised for
//! real; NULLs never collide, matching SQL unique-index semantics.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Clause, ColumnDef, DbError, DbInterface, DbTransaction, IndexDef, SqlRow, SqlValue};

type MemRow = HashMap<String, SqlValue>;

static NULL_VALUE: SqlValue = SqlValue::Null;

fn cell<'a>(row: &'a MemRow, column: &str) -> &'a SqlValue {
    row.get(column).unwrap_or(&NULL_VALUE)
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<ColumnDef>,
    indexes: HashMap<String, IndexDef>,
    rows: Vec<MemRow>,
}

#[derive(Debug, Clone, Default)]
struct MemState {
    tables: HashMap<String, MemTable>,
}

/// An in-memory database.
pub struct MemDatabase {
    state: Arc<Mutex<MemState>>,
    gate: Arc<tokio::sync::Mutex<()>>,
    max_conjunction_params: usize,
}

impl MemDatabase {
    pub fn new() -> Self {
        Self::with_max_conjunction_params(25)
    }

    /// A database whose IN-list budget is `max`; small values force the
    /// chunked operations in the record store to actually chunk.
    pub fn with_max_conjunction_params(max: usize) -> Self {
        MemDatabase {
            state: Arc::new(Mutex::new(MemState::default())),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            max_conjunction_params: max.max(1),
        }
    }

    /// Snapshot of a table's rows, for assertions in tests.
    pub fn snapshot_rows(&self, table: &str) -> Vec<HashMap<String, SqlValue>> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

impl Default for MemDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_clause(row: &MemRow, clause: &Clause) -> bool {
    match clause {
        Clause::Eq(column, value) => !value.is_null() && cell(row, column) == value,
        Clause::Ne(column, value) => {
            let current = cell(row, column);
            !current.is_null() && current != value
        },
        Clause::In(column, values) => {
            let current = cell(row, column);
            !current.is_null() && values.contains(current)
        },
    }
}

fn matches_all(row: &MemRow, clauses: &[Clause]) -> bool {
    clauses.iter().all(|c| matches_clause(row, c))
}

/// Check that `candidate` does not collide with any other row on a unique
/// index. `skip` is the position of the row being updated, if any.
fn check_unique(
    table: &MemTable,
    candidate: &MemRow,
    skip: Option<usize>,
) -> Result<(), DbError> {
    for index in table.indexes.values().filter(|i| i.unique) {
        let key: Vec<&SqlValue> = index
            .columns
            .iter()
            .map(|c| cell(candidate, c))
            .collect();
        if key.iter().any(|v| v.is_null()) {
            continue;
        }
        for (position, row) in table.rows.iter().enumerate() {
            if Some(position) == skip {
                continue;
            }
            let other: Vec<&SqlValue> = index
                .columns
                .iter()
                .map(|c| cell(row, c))
                .collect();
            if key == other {
                return Err(DbError::UniqueViolation(format!(
                    "duplicate key on ({})",
                    index.columns.join(", ")
                )));
            }
        }
    }
    Ok(())
}

struct MemTransaction {
    state: Arc<Mutex<MemState>>,
    snapshot: MemState,
    finished: bool,
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for MemTransaction {
    fn drop(&mut self) {
        if !self.finished {
            *self.state.lock() = self.snapshot.clone();
        }
    }
}

#[async_trait]
impl DbTransaction for MemTransaction {
    async fn query(
        &mut self,
        table: &str,
        columns: &[&str],
        clauses: &[Clause],
        _for_update: bool,
    ) -> Result<Vec<SqlRow>, DbError> {
        let state = self.state.lock();
        let Some(table) = state.tables.get(table) else {
            return Err(DbError::Backend(format!("no such table: {table}")));
        };
        Ok(table
            .rows
            .iter()
            .filter(|row| matches_all(row, clauses))
            .map(|row| {
                let projected = columns
                    .iter()
                    .map(|c| {
                        let value = row.get(*c).cloned().unwrap_or(SqlValue::Null);
                        (c.to_string(), value)
                    })
                    .collect();
                SqlRow::new(projected)
            })
            .collect())
    }

    async fn insert(
        &mut self,
        table: &str,
        values: &[(&'static str, SqlValue)],
    ) -> Result<(), DbError> {
        let mut state = self.state.lock();
        let Some(table) = state.tables.get_mut(table) else {
            return Err(DbError::Backend(format!("no such table: {table}")));
        };
        let mut row: MemRow = table
            .columns
            .iter()
            .map(|c| (c.name.clone(), SqlValue::Null))
            .collect();
        for (column, value) in values {
            row.insert(column.to_string(), value.clone());
        }
        check_unique(table, &row, None)?;
        table.rows.push(row);
        Ok(())
    }

    async fn update(
        &mut self,
        table: &str,
        set: &[(&'static str, SqlValue)],
        clauses: &[Clause],
    ) -> Result<u64, DbError> {
        let mut state = self.state.lock();
        let Some(table) = state.tables.get_mut(table) else {
            return Err(DbError::Backend(format!("no such table: {table}")));
        };
        let positions: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| matches_all(row, clauses))
            .map(|(i, _)| i)
            .collect();
        for &position in &positions {
            let mut updated = table.rows[position].clone();
            for (column, value) in set {
                updated.insert(column.to_string(), value.clone());
            }
            check_unique(table, &updated, Some(position))?;
            table.rows[position] = updated;
        }
        Ok(positions.len() as u64)
    }

    async fn delete(&mut self, table: &str, clauses: &[Clause]) -> Result<u64, DbError> {
        let mut state = self.state.lock();
        let Some(table) = state.tables.get_mut(table) else {
            return Err(DbError::Backend(format!("no such table: {table}")));
        };
        let before = table.rows.len();
        table.rows.retain(|row| !matches_all(row, clauses));
        Ok((before - table.rows.len()) as u64)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        *self.state.lock() = self.snapshot.clone();
        self.finished = true;
        Ok(())
    }
}

#[async_trait]
impl DbInterface for MemDatabase {
    async fn table_schema(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, DbError> {
        Ok(self.state.lock().tables.get(table).map(|t| t.columns.clone()))
    }

    async fn table_indexes(&self, table: &str) -> Result<HashMap<String, IndexDef>, DbError> {
        Ok(self
            .state
            .lock()
            .tables
            .get(table)
            .map(|t| t.indexes.clone())
            .unwrap_or_default())
    }

    async fn perform_create(&self, table: &str, columns: &[ColumnDef]) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if state.tables.contains_key(table) {
            return Err(DbError::Backend(format!("table already exists: {table}")));
        }
        state.tables.insert(
            table.to_string(),
            MemTable {
                columns: columns.to_vec(),
                ..MemTable::default()
            },
        );
        Ok(())
    }

    async fn perform_add_columns(
        &self,
        table: &str,
        columns: &[ColumnDef],
    ) -> Result<(), DbError> {
        let mut state = self.state.lock();
        let Some(table) = state.tables.get_mut(table) else {
            return Err(DbError::Backend(format!("no such table: {table}")));
        };
        for column in columns {
            table.columns.push(column.clone());
            for row in &mut table.rows {
                row.insert(column.name.clone(), SqlValue::Null);
            }
        }
        Ok(())
    }

    async fn perform_drop(&self, table: &str) -> Result<(), DbError> {
        self.state.lock().tables.remove(table);
        Ok(())
    }

    async fn perform_add_index(&self, table: &str, index: &IndexDef) -> Result<(), DbError> {
        let mut state = self.state.lock();
        let Some(mem_table) = state.tables.get_mut(table) else {
            return Err(DbError::Backend(format!("no such table: {table}")));
        };
        let name = format!("idx_{}_{}", table, index.columns.join("_"));
        mem_table.indexes.insert(name, index.clone());
        Ok(())
    }

    async fn perform_remove_index(&self, table: &str, index_name: &str) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if let Some(table) = state.tables.get_mut(table) {
            table.indexes.remove(index_name);
        }
        Ok(())
    }

    fn conjunction_clause_max(&self, fixed: &[Clause]) -> usize {
        self.max_conjunction_params
            .saturating_sub(super::clause_param_count(fixed))
            .max(1)
    }

    async fn begin(&self) -> Result<Box<dyn DbTransaction>, DbError> {
        let permit = self.gate.clone().lock_owned().await;
        let snapshot = self.state.lock().clone();
        Ok(Box::new(MemTransaction {
            state: self.state.clone(),
            snapshot,
            finished: false,
            _permit: permit,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", "BIGINT", true, false),
            ColumnDef::new("doc_key", "VARCHAR(73)", false, false),
            ColumnDef::new("doc_uri", "TEXT", false, true),
        ]
    }

    async fn sample_db() -> MemDatabase {
        let db = MemDatabase::new();
        db.perform_create("t", &sample_columns()).await.unwrap();
        db.perform_add_index("t", &IndexDef::new(true, &["doc_key"]))
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_insert_query_delete() {
        let db = sample_db().await;
        let mut tx = db.begin().await.unwrap();
        tx.insert("t", &[("id", 1i64.into()), ("doc_key", "a".into())])
            .await
            .unwrap();
        tx.insert("t", &[("id", 2i64.into()), ("doc_key", "b".into())])
            .await
            .unwrap();
        let rows = tx
            .query("t", &["id"], &[Clause::Eq("doc_key", "a".into())], false)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("id").unwrap(), 1);

        let removed = tx
            .delete("t", &[Clause::Ne("doc_key", "a".into())])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        tx.commit().await.unwrap();
        assert_eq!(db.snapshot_rows("t").len(), 1);
    }

    #[tokio::test]
    async fn test_unique_index_enforced() {
        let db = sample_db().await;
        let mut tx = db.begin().await.unwrap();
        tx.insert("t", &[("id", 1i64.into()), ("doc_key", "a".into())])
            .await
            .unwrap();
        let err = tx
            .insert("t", &[("id", 2i64.into()), ("doc_key", "a".into())])
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn test_nulls_do_not_collide() {
        let db = MemDatabase::new();
        db.perform_create("t", &sample_columns()).await.unwrap();
        db.perform_add_index("t", &IndexDef::new(true, &["doc_uri"]))
            .await
            .unwrap();
        let mut tx = db.begin().await.unwrap();
        tx.insert("t", &[("id", 1i64.into()), ("doc_key", "a".into())])
            .await
            .unwrap();
        tx.insert("t", &[("id", 2i64.into()), ("doc_key", "b".into())])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(db.snapshot_rows("t").len(), 2);
    }

    #[tokio::test]
    async fn test_drop_rolls_back_uncommitted_work() {
        let db = sample_db().await;
        {
            let mut tx = db.begin().await.unwrap();
            tx.insert("t", &[("id", 1i64.into()), ("doc_key", "a".into())])
                .await
                .unwrap();
            // dropped without commit
        }
        assert!(db.snapshot_rows("t").is_empty());
    }

    #[tokio::test]
    async fn test_explicit_rollback() {
        let db = sample_db().await;
        let tx_box = {
            let mut tx = db.begin().await.unwrap();
            tx.insert("t", &[("id", 1i64.into()), ("doc_key", "a".into())])
                .await
                .unwrap();
            tx
        };
        tx_box.rollback().await.unwrap();
        assert!(db.snapshot_rows("t").is_empty());
    }

    #[tokio::test]
    async fn test_update_counts_rows() {
        let db = sample_db().await;
        let mut tx = db.begin().await.unwrap();
        tx.insert("t", &[("id", 1i64.into()), ("doc_key", "a".into())])
            .await
            .unwrap();
        tx.insert("t", &[("id", 2i64.into()), ("doc_key", "b".into())])
            .await
            .unwrap();
        let changed = tx
            .update("t", &[("doc_uri", "http://x".into())], &[])
            .await
            .unwrap();
        assert_eq!(changed, 2);
        tx.commit().await.unwrap();
    }

    #[test]
    fn test_conjunction_clause_max_respects_fixed_clauses() {
        let db = MemDatabase::with_max_conjunction_params(10);
        let fixed = [Clause::Eq("output_connection", "web".into())];
        assert_eq!(db.conjunction_clause_max(&fixed), 9);
        assert_eq!(db.conjunction_clause_max(&[]), 10);
    }
}
