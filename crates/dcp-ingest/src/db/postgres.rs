//! PostgreSQL backend
//!
//! Every statement here is assembled at runtime from the structured clause
//! model, so this module uses the sqlx runtime query API throughout. Error
//! classification follows the SQLSTATE taxonomy: `40001` (serialization
//! failure) and `40P01` (deadlock detected) become transient aborts; unique
//! violations are reported as such so the upsert loop can restart.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::time::Duration;

use super::{Clause, ColumnDef, DbError, DbInterface, DbTransaction, IndexDef, SqlRow, SqlValue};

/// Upper bound on bound parameters per conjunction; IN-lists are chunked to
/// stay within it.
const MAX_CONJUNCTION_PARAMS: usize = 100;

/// Connection settings for the Postgres backend.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgConfig {
    /// Read settings from the environment: `DCP_DATABASE_URL` (falling back
    /// to `DATABASE_URL`), `DCP_DB_MAX_CONNECTIONS`, and
    /// `DCP_DB_ACQUIRE_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, DbError> {
        let url = std::env::var("DCP_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| {
                DbError::Backend("DCP_DATABASE_URL or DATABASE_URL must be set".to_string())
            })?;
        let max_connections = std::env::var("DCP_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let acquire_timeout = std::env::var("DCP_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));
        Ok(PgConfig {
            url,
            max_connections,
            acquire_timeout,
        })
    }
}

/// The production database backend.
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub async fn connect(config: &PgConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(map_sqlx)?;
        Ok(PgDatabase { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgDatabase { pool }
    }
}

fn map_sqlx(e: sqlx::Error) -> DbError {
    if let sqlx::Error::Database(ref db) = e {
        if db.is_unique_violation() {
            return DbError::UniqueViolation(db.to_string());
        }
        if let Some(code) = db.code() {
            if code == "40001" || code == "40P01" {
                return DbError::TransactionAbort(db.to_string());
            }
        }
    }
    DbError::Backend(e.to_string())
}

/// Append `clauses` as a conjunction, numbering placeholders from
/// `*param_index` and collecting the bound values into `params`.
fn push_clauses(
    sql: &mut String,
    clauses: &[Clause],
    params: &mut Vec<SqlValue>,
    param_index: &mut usize,
) {
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            sql.push_str(" AND ");
        }
        match clause {
            Clause::Eq(column, value) => {
                sql.push_str(&format!("{column} = ${param_index}"));
                *param_index += 1;
                params.push(value.clone());
            },
            Clause::Ne(column, value) => {
                sql.push_str(&format!("{column} != ${param_index}"));
                *param_index += 1;
                params.push(value.clone());
            },
            Clause::In(column, values) => {
                if values.is_empty() {
                    sql.push_str("FALSE");
                    continue;
                }
                sql.push_str(&format!("{column} IN ("));
                for (j, value) in values.iter().enumerate() {
                    if j > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str(&format!("${param_index}"));
                    *param_index += 1;
                    params.push(value.clone());
                }
                sql.push(')');
            },
        }
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::BigInt(v) => query.bind(*v),
        SqlValue::Null => query.bind(Option::<String>::None),
    }
}

fn decode_row(row: &PgRow) -> Result<SqlRow, DbError> {
    let mut values = HashMap::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(map_sqlx)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else if raw.type_info().name() == "INT8" {
            SqlValue::BigInt(row.try_get::<i64, _>(i).map_err(map_sqlx)?)
        } else {
            SqlValue::Text(row.try_get::<String, _>(i).map_err(map_sqlx)?)
        };
        values.insert(column.name().to_string(), value);
    }
    Ok(SqlRow::new(values))
}

fn column_ddl(column: &ColumnDef) -> String {
    let mut ddl = format!("{} {}", column.name, column.sql_type);
    if column.primary_key {
        ddl.push_str(" PRIMARY KEY");
    } else if !column.nullable {
        ddl.push_str(" NOT NULL");
    }
    ddl
}

fn index_name(table: &str, index: &IndexDef) -> String {
    format!("idx_{}_{}", table, index.columns.join("_"))
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl DbTransaction for PgTransaction {
    async fn query(
        &mut self,
        table: &str,
        columns: &[&str],
        clauses: &[Clause],
        for_update: bool,
    ) -> Result<Vec<SqlRow>, DbError> {
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table);
        let mut params = Vec::new();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            let mut param_index = 1;
            push_clauses(&mut sql, clauses, &mut params, &mut param_index);
        }
        if for_update {
            sql.push_str(" FOR UPDATE");
        }

        let mut query = sqlx::query(&sql);
        for value in &params {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&mut *self.tx).await.map_err(map_sqlx)?;
        rows.iter().map(decode_row).collect()
    }

    async fn insert(
        &mut self,
        table: &str,
        values: &[(&'static str, SqlValue)],
    ) -> Result<(), DbError> {
        let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in values {
            query = bind_value(query, value);
        }
        query.execute(&mut *self.tx).await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn update(
        &mut self,
        table: &str,
        set: &[(&'static str, SqlValue)],
        clauses: &[Clause],
    ) -> Result<u64, DbError> {
        let mut sql = format!("UPDATE {table} SET ");
        let mut params = Vec::new();
        let mut param_index = 1;
        for (i, (column, value)) in set.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("{column} = ${param_index}"));
            param_index += 1;
            params.push(value.clone());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            push_clauses(&mut sql, clauses, &mut params, &mut param_index);
        }

        let mut query = sqlx::query(&sql);
        for value in &params {
            query = bind_value(query, value);
        }
        let result = query.execute(&mut *self.tx).await.map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn delete(&mut self, table: &str, clauses: &[Clause]) -> Result<u64, DbError> {
        let mut sql = format!("DELETE FROM {table}");
        let mut params = Vec::new();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            let mut param_index = 1;
            push_clauses(&mut sql, clauses, &mut params, &mut param_index);
        }

        let mut query = sqlx::query(&sql);
        for value in &params {
            query = bind_value(query, value);
        }
        let result = query.execute(&mut *self.tx).await.map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback().await.map_err(map_sqlx)
    }
}

#[async_trait]
impl DbInterface for PgDatabase {
    async fn table_schema(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, DbError> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name, data_type::text AS data_type, \
             is_nullable::text AS is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if rows.is_empty() {
            return Ok(None);
        }
        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("column_name").map_err(map_sqlx)?;
            let sql_type: String = row.try_get("data_type").map_err(map_sqlx)?;
            let nullable: String = row.try_get("is_nullable").map_err(map_sqlx)?;
            // Primary-key membership is not reported here; schema
            // reconciliation only needs column presence.
            columns.push(ColumnDef {
                name,
                sql_type,
                primary_key: false,
                nullable: nullable == "YES",
            });
        }
        Ok(Some(columns))
    }

    async fn table_indexes(&self, table: &str) -> Result<HashMap<String, IndexDef>, DbError> {
        let rows = sqlx::query(
            "SELECT i.relname::text AS index_name, ix.indisunique AS is_unique, \
             a.attname::text AS column_name \
             FROM pg_index ix \
             JOIN pg_class t ON t.oid = ix.indrelid \
             JOIN pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
             WHERE t.relname = $1 AND n.nspname = current_schema() AND NOT ix.indisprimary \
             ORDER BY i.relname, k.ord",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut indexes: HashMap<String, IndexDef> = HashMap::new();
        for row in &rows {
            let name: String = row.try_get("index_name").map_err(map_sqlx)?;
            let unique: bool = row.try_get("is_unique").map_err(map_sqlx)?;
            let column: String = row.try_get("column_name").map_err(map_sqlx)?;
            indexes
                .entry(name)
                .or_insert_with(|| IndexDef {
                    unique,
                    columns: Vec::new(),
                })
                .columns
                .push(column);
        }
        Ok(indexes)
    }

    async fn perform_create(&self, table: &str, columns: &[ColumnDef]) -> Result<(), DbError> {
        let ddl: Vec<String> = columns.iter().map(column_ddl).collect();
        let sql = format!("CREATE TABLE {} ({})", table, ddl.join(", "));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn perform_add_columns(
        &self,
        table: &str,
        columns: &[ColumnDef],
    ) -> Result<(), DbError> {
        for column in columns {
            let sql = format!("ALTER TABLE {} ADD COLUMN {}", table, column_ddl(column));
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn perform_drop(&self, table: &str) -> Result<(), DbError> {
        let sql = format!("DROP TABLE IF EXISTS {table}");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn perform_add_index(&self, table: &str, index: &IndexDef) -> Result<(), DbError> {
        let sql = format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            index_name(table, index),
            table,
            index.columns.join(", ")
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn perform_remove_index(&self, _table: &str, index_name: &str) -> Result<(), DbError> {
        let sql = format!("DROP INDEX IF EXISTS {index_name}");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    fn conjunction_clause_max(&self, fixed: &[Clause]) -> usize {
        MAX_CONJUNCTION_PARAMS
            .saturating_sub(super::clause_param_count(fixed))
            .max(1)
    }

    async fn begin(&self) -> Result<Box<dyn DbTransaction>, DbError> {
        let tx = self.pool.begin().await.map_err(map_sqlx)?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_clauses_numbers_placeholders() {
        let mut sql = String::new();
        let mut params = Vec::new();
        let mut index = 1;
        push_clauses(
            &mut sql,
            &[
                Clause::Eq("doc_key", SqlValue::from("web:h1")),
                Clause::In("id", vec![SqlValue::from(1i64), SqlValue::from(2i64)]),
                Clause::Ne("doc_key", SqlValue::from("web:h2")),
            ],
            &mut params,
            &mut index,
        );
        assert_eq!(sql, "doc_key = $1 AND id IN ($2, $3) AND doc_key != $4");
        assert_eq!(params.len(), 4);
        assert_eq!(index, 5);
    }

    #[test]
    fn test_empty_in_list_matches_nothing() {
        let mut sql = String::new();
        let mut params = Vec::new();
        let mut index = 1;
        push_clauses(&mut sql, &[Clause::In("id", vec![])], &mut params, &mut index);
        assert_eq!(sql, "FALSE");
        assert!(params.is_empty());
    }

    #[test]
    fn test_column_ddl() {
        let pk = ColumnDef::new("id", "BIGINT", true, false);
        let nullable = ColumnDef::new("doc_uri", "TEXT", false, true);
        let required = ColumnDef::new("doc_key", "VARCHAR(73)", false, false);
        assert_eq!(column_ddl(&pk), "id BIGINT PRIMARY KEY");
        assert_eq!(column_ddl(&nullable), "doc_uri TEXT");
        assert_eq!(column_ddl(&required), "doc_key VARCHAR(73) NOT NULL");
    }

    #[test]
    fn test_index_name_is_deterministic() {
        let index = IndexDef::new(true, &["doc_key", "output_connection"]);
        assert_eq!(
            index_name("ingeststatus", &index),
            "idx_ingeststatus_doc_key_output_connection"
        );
    }
}
