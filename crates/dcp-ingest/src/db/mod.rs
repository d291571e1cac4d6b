//! Database collaborator interface
//!
//! The record store drives its backend through structured operations rather
//! than SQL strings: a typed value model, conjunction clauses, and explicit
//! transaction handles. That keeps both backends honest about parameters and
//! makes the in-list budget ([`DbInterface::conjunction_clause_max`])
//! computable, which every chunked operation depends on.
//!
//! Two implementations ship: [`postgres::PgDatabase`] for production and
//! [`memory::MemDatabase`] for tests and embedded use.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Database errors, classified the way the retry loops need them.
#[derive(Error, Debug)]
pub enum DbError {
    /// Deadlock or serialization abort; retried with backoff, never surfaced.
    #[error("transaction aborted: {0}")]
    TransactionAbort(String),

    /// Unique-constraint violation; converted into an upsert-loop restart.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A result row lacked a column or held an unexpected type.
    #[error("malformed result row: {0}")]
    MalformedRow(String),

    /// Any other backend failure; permanent at this layer.
    #[error("database failure: {0}")]
    Backend(String),
}

impl DbError {
    pub fn is_transaction_abort(&self) -> bool {
        matches!(self, DbError::TransactionAbort(_))
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DbError::UniqueViolation(_))
    }
}

/// A value bound into a statement or read out of a result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(String),
    BigInt(i64),
    Null,
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// `Text` for `Some`, `Null` for `None`.
    pub fn opt_text(value: Option<&str>) -> SqlValue {
        match value {
            Some(v) => SqlValue::Text(v.to_string()),
            None => SqlValue::Null,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(v)
    }
}

/// One conjunct of a WHERE clause.
#[derive(Debug, Clone)]
pub enum Clause {
    /// `column = value`
    Eq(&'static str, SqlValue),
    /// `column IN (values...)`
    In(&'static str, Vec<SqlValue>),
    /// `column != value`
    Ne(&'static str, SqlValue),
}

impl Clause {
    /// Number of bound parameters this clause consumes.
    pub fn param_count(&self) -> usize {
        match self {
            Clause::Eq(_, _) | Clause::Ne(_, _) => 1,
            Clause::In(_, values) => values.len(),
        }
    }
}

/// Total bound parameters across a clause list.
pub fn clause_param_count(clauses: &[Clause]) -> usize {
    clauses.iter().map(Clause::param_count).sum()
}

/// One result row, keyed by column name.
#[derive(Debug, Clone, Default)]
pub struct SqlRow(HashMap<String, SqlValue>);

impl SqlRow {
    pub fn new(values: HashMap<String, SqlValue>) -> Self {
        SqlRow(values)
    }

    fn value(&self, column: &str) -> Result<&SqlValue, DbError> {
        self.0
            .get(column)
            .ok_or_else(|| DbError::MalformedRow(format!("missing column '{column}'")))
    }

    pub fn get_i64(&self, column: &str) -> Result<i64, DbError> {
        match self.value(column)? {
            SqlValue::BigInt(v) => Ok(*v),
            other => Err(DbError::MalformedRow(format!(
                "column '{column}' is not a bigint: {other:?}"
            ))),
        }
    }

    pub fn get_text(&self, column: &str) -> Result<&str, DbError> {
        match self.value(column)? {
            SqlValue::Text(v) => Ok(v),
            other => Err(DbError::MalformedRow(format!(
                "column '{column}' is not text: {other:?}"
            ))),
        }
    }

    /// Text column that may be NULL.
    pub fn opt_text(&self, column: &str) -> Result<Option<&str>, DbError> {
        match self.value(column)? {
            SqlValue::Text(v) => Ok(Some(v)),
            SqlValue::Null => Ok(None),
            other => Err(DbError::MalformedRow(format!(
                "column '{column}' is not text: {other:?}"
            ))),
        }
    }
}

/// Declarative column description for installs and schema reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub primary_key: bool,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: &str, sql_type: &str, primary_key: bool, nullable: bool) -> Self {
        ColumnDef {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            primary_key,
            nullable,
        }
    }
}

/// Declarative index description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub unique: bool,
    pub columns: Vec<String>,
}

impl IndexDef {
    pub fn new(unique: bool, columns: &[&str]) -> Self {
        IndexDef {
            unique,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// One open transaction. Dropping an uncommitted transaction rolls it back.
#[async_trait]
pub trait DbTransaction: Send {
    /// SELECT `columns` FROM `table` WHERE all `clauses` hold, optionally
    /// locking the matched rows for update.
    async fn query(
        &mut self,
        table: &str,
        columns: &[&str],
        clauses: &[Clause],
        for_update: bool,
    ) -> Result<Vec<SqlRow>, DbError>;

    /// INSERT one row.
    async fn insert(
        &mut self,
        table: &str,
        values: &[(&'static str, SqlValue)],
    ) -> Result<(), DbError>;

    /// UPDATE matching rows; returns the number of rows changed.
    async fn update(
        &mut self,
        table: &str,
        set: &[(&'static str, SqlValue)],
        clauses: &[Clause],
    ) -> Result<u64, DbError>;

    /// DELETE matching rows; returns the number of rows removed.
    async fn delete(&mut self, table: &str, clauses: &[Clause]) -> Result<u64, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// A database backend.
#[async_trait]
pub trait DbInterface: Send + Sync {
    /// Existing column set of a table, or `None` if the table is absent.
    async fn table_schema(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, DbError>;

    /// Existing secondary indexes on a table, keyed by index name.
    /// Primary-key indexes are not reported.
    async fn table_indexes(&self, table: &str) -> Result<HashMap<String, IndexDef>, DbError>;

    async fn perform_create(&self, table: &str, columns: &[ColumnDef]) -> Result<(), DbError>;

    /// ALTER TABLE: add the given columns.
    async fn perform_add_columns(
        &self,
        table: &str,
        columns: &[ColumnDef],
    ) -> Result<(), DbError>;

    async fn perform_drop(&self, table: &str) -> Result<(), DbError>;

    /// Create a secondary index; the backend chooses a deterministic name.
    async fn perform_add_index(&self, table: &str, index: &IndexDef) -> Result<(), DbError>;

    async fn perform_remove_index(&self, table: &str, index_name: &str) -> Result<(), DbError>;

    /// Maximum number of values one `IN (...)` list may carry in a WHERE
    /// clause that already contains `fixed`. Never less than 1.
    fn conjunction_clause_max(&self, fixed: &[Clause]) -> usize;

    async fn begin(&self) -> Result<Box<dyn DbTransaction>, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clause_param_count() {
        let clauses = vec![
            Clause::Eq("a", SqlValue::from("x")),
            Clause::In("b", vec![SqlValue::from(1i64), SqlValue::from(2i64)]),
            Clause::Ne("c", SqlValue::from("y")),
        ];
        assert_eq!(clause_param_count(&clauses), 4);
    }

    #[test]
    fn test_sql_row_typed_getters() {
        let mut values = HashMap::new();
        values.insert("id".to_string(), SqlValue::BigInt(7));
        values.insert("uri".to_string(), SqlValue::Null);
        values.insert("key".to_string(), SqlValue::Text("web:h".to_string()));
        let row = SqlRow::new(values);

        assert_eq!(row.get_i64("id").unwrap(), 7);
        assert_eq!(row.opt_text("uri").unwrap(), None);
        assert_eq!(row.get_text("key").unwrap(), "web:h");
        assert!(row.get_text("missing").is_err());
        assert!(row.get_i64("key").is_err());
    }

    #[test]
    fn test_opt_text_value() {
        assert_eq!(SqlValue::opt_text(None), SqlValue::Null);
        assert_eq!(SqlValue::opt_text(Some("v")), SqlValue::Text("v".into()));
    }
}
