use crate::db::pool::ShippingDbManager;
use crate::error::{first_line, AgentError};
use r2d2::Pool;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// Structured result of one validated query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Runs validated statements against the shipping database. A connection is
/// checked out inside the blocking task and dropped on every exit path, so
/// it is never held while the model is generating. Retry policy lives in the
/// correction loop, never here.
pub struct SqlExecutor {
    pool: Pool<ShippingDbManager>,
    timeout: Duration,
    max_rows: usize,
}

impl SqlExecutor {
    pub fn new(pool: Pool<ShippingDbManager>, timeout: Duration, max_rows: usize) -> Self {
        Self {
            pool,
            timeout,
            max_rows,
        }
    }

    pub async fn execute(&self, statement: &str) -> Result<QueryResult, AgentError> {
        debug!("Executing SQL: {}", statement);

        let pool = self.pool.clone();
        let sql = statement.to_string();
        let cap = self.max_rows;

        let task = tokio::task::spawn_blocking(move || -> Result<QueryResult, String> {
            let conn = pool.get().map_err(|e| first_line(&e.to_string()))?;

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| first_line(&e.to_string()))?;

            let mut columns: Vec<String> = Vec::new();
            let mut out_rows = Vec::new();
            {
                let mut rows = stmt.query([]).map_err(|e| first_line(&e.to_string()))?;
                while let Some(row) = rows.next().map_err(|e| first_line(&e.to_string()))? {
                    if columns.is_empty() {
                        let stmt_ref: &duckdb::Statement<'_> = row.as_ref();
                        for i in 0..stmt_ref.column_count() {
                            let name = stmt_ref
                                .column_name(i)
                                .map(|n| n.to_string())
                                .unwrap_or_else(|_| format!("column_{}", i));
                            columns.push(name);
                        }
                    }
                    if out_rows.len() >= cap {
                        break;
                    }
                    let mut record = serde_json::Map::new();
                    for (i, name) in columns.iter().enumerate() {
                        record.insert(name.clone(), value_at(row, i));
                    }
                    out_rows.push(record);
                }
            }

            // Empty results still carry the column list.
            if columns.is_empty() {
                for i in 0..stmt.column_count() {
                    let name = stmt
                        .column_name(i)
                        .map(|n| n.to_string())
                        .unwrap_or_else(|_| format!("column_{}", i));
                    columns.push(name);
                }
            }

            Ok(QueryResult {
                columns,
                rows: out_rows,
            })
        });

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(AgentError::ExecutionTimeout(self.timeout)),
            Ok(Err(join_err)) => Err(AgentError::ExecutionError(join_err.to_string())),
            Ok(Ok(Err(db_err))) => Err(AgentError::ExecutionError(db_err)),
            Ok(Ok(Ok(result))) => {
                info!(
                    "Query executed successfully, {} row(s) returned",
                    result.row_count()
                );
                Ok(result)
            }
        }
    }
}

fn value_at(row: &duckdb::Row, idx: usize) -> Value {
    use duckdb::types::ValueRef;

    match row.get_ref(idx) {
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Boolean(b)) => Value::Bool(b),
        Ok(ValueRef::TinyInt(v)) => Value::from(v),
        Ok(ValueRef::SmallInt(v)) => Value::from(v),
        Ok(ValueRef::Int(v)) => Value::from(v),
        Ok(ValueRef::BigInt(v)) => Value::from(v),
        Ok(ValueRef::UTinyInt(v)) => Value::from(v),
        Ok(ValueRef::USmallInt(v)) => Value::from(v),
        Ok(ValueRef::UInt(v)) => Value::from(v),
        Ok(ValueRef::UBigInt(v)) => Value::from(v),
        Ok(ValueRef::Float(v)) => Value::from(v),
        Ok(ValueRef::Double(v)) => Value::from(v),
        Ok(ValueRef::Text(t)) => Value::String(String::from_utf8_lossy(t).into_owned()),
        // Dates, timestamps, decimals and the rest render as text.
        Ok(_) => row
            .get::<_, String>(idx)
            .map(Value::String)
            .unwrap_or(Value::Null),
        Err(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(max_rows: usize) -> (SqlExecutor, Pool<ShippingDbManager>) {
        let pool = Pool::builder()
            .max_size(1)
            .build(ShippingDbManager::new(":memory:".to_string(), false))
            .expect("pool");
        let conn = pool.get().expect("connection");
        conn.execute_batch(
            "CREATE TABLE shipment (id INTEGER, status VARCHAR, cost DOUBLE); \
             INSERT INTO shipment VALUES (1, 'pending', 10.5), (2, 'delivered', 20.0), (3, 'pending', 7.25);",
        )
        .expect("seed");
        drop(conn);
        (
            SqlExecutor::new(pool.clone(), Duration::from_secs(10), max_rows),
            pool,
        )
    }

    #[tokio::test]
    async fn rows_come_back_as_column_value_mappings() {
        let (executor, _pool) = executor(100);
        let result = executor
            .execute("SELECT id, status FROM shipment ORDER BY id")
            .await
            .expect("execute");

        assert_eq!(result.columns, vec!["id", "status"]);
        assert_eq!(result.row_count(), 3);
        assert_eq!(result.rows[0]["id"], Value::from(1));
        assert_eq!(result.rows[0]["status"], Value::from("pending"));
    }

    #[tokio::test]
    async fn row_cap_bounds_the_result() {
        let (executor, _pool) = executor(2);
        let result = executor
            .execute("SELECT id FROM shipment ORDER BY id")
            .await
            .expect("execute");
        assert_eq!(result.row_count(), 2);
    }

    #[tokio::test]
    async fn count_query_yields_single_row() {
        let (executor, _pool) = executor(100);
        let result = executor
            .execute("SELECT count(*) AS count FROM shipment WHERE status = 'pending'")
            .await
            .expect("execute");
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.rows[0]["count"], Value::from(2));
    }

    #[tokio::test]
    async fn database_errors_surface_as_execution_error() {
        let (executor, _pool) = executor(100);
        let err = executor
            .execute("SELECT nope FROM shipment")
            .await
            .expect_err("should fail");
        assert!(matches!(err, AgentError::ExecutionError(_)));
    }

    #[tokio::test]
    async fn empty_result_keeps_columns() {
        let (executor, _pool) = executor(100);
        let result = executor
            .execute("SELECT id, status FROM shipment WHERE id > 100")
            .await
            .expect("execute");
        assert_eq!(result.columns, vec!["id", "status"]);
        assert!(result.rows.is_empty());
    }
}
