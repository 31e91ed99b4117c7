//! Loading cleaned tables into SQL and querying them back
//!
//! All pooled work goes through
//! [`ConnectionPoolManager::with_connection`](crate::pool::ConnectionPoolManager::with_connection).
//! Each table is replaced wholesale: drop, create and insert run in one
//! transaction, so a failed load leaves the previous table in place on
//! backends with transactional DDL.

use crate::context::PipelineContext;
use crate::datasets::table_name_for_key;
use crate::error::{PipelineError, Result};
use crate::pool::{redact_dsn, Backend};
use futures::FutureExt;
use leadflow_common::{Column, ColumnKind, Table, Value};
use serde::Serialize;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Column as _, Connection, Row, ValueRef};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// SQLite caps bound parameters per statement at 999.
const MAX_PARAMS_PER_STATEMENT: usize = 900;

#[derive(Debug, Clone, Serialize)]
pub struct TableLoad {
    pub succeeded: bool,
    pub row_count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SqlLoadReport {
    pub success: bool,
    pub tables_loaded: usize,
    pub total: usize,
    pub tables: BTreeMap<String, TableLoad>,
}

impl SqlLoadReport {
    fn record(&mut self, table: String, outcome: Result<usize>) {
        let load = match outcome {
            Ok(rows) => {
                info!(table = %table, rows, "Table loaded");
                self.tables_loaded += 1;
                TableLoad {
                    succeeded: true,
                    row_count: rows,
                    error: None,
                }
            },
            Err(e) => return self.record_error(table, e.to_string()),
        };
        self.insert(table, load);
    }

    fn record_error(&mut self, table: String, message: String) {
        error!(table = %table, error = %message, "Table load failed");
        let load = TableLoad {
            succeeded: false,
            row_count: 0,
            error: Some(message),
        };
        self.insert(table, load);
    }

    fn insert(&mut self, table: String, load: TableLoad) {
        self.tables.insert(table, load);
        self.total = self.tables.len();
        self.success = self.total > 0 && self.tables_loaded == self.total;
    }

    pub fn first_error(&self) -> Option<&str> {
        self.tables.values().find_map(|t| t.error.as_deref())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub backend: Backend,
    pub dsn: String,
    pub error: Option<String>,
}

/// Identifier quoting, placeholders and column types per backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    backend: Backend,
}

impl Dialect {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn quote(&self, ident: &str) -> String {
        match self.backend {
            Backend::MySql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    fn placeholder(&self, n: usize) -> String {
        match self.backend {
            Backend::Postgres => format!("${n}"),
            _ => "?".to_string(),
        }
    }

    pub fn column_type(&self, kind: ColumnKind) -> &'static str {
        match (kind, self.backend) {
            (ColumnKind::Number, Backend::MySql) => "DOUBLE",
            (ColumnKind::Number, _) => "DOUBLE PRECISION",
            (ColumnKind::Text | ColumnKind::Date, _) => "TEXT",
        }
    }

    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote(table))
    }

    pub fn create_table(&self, table: &str, columns: &[Column]) -> String {
        let defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", self.quote(&c.name), self.column_type(c.kind)))
            .collect();
        format!("CREATE TABLE {} ({})", self.quote(table), defs.join(", "))
    }

    pub fn insert(&self, table: &str, columns: &[Column], rows: usize) -> String {
        let names: Vec<String> = columns.iter().map(|c| self.quote(&c.name)).collect();
        let mut n = 0;
        let tuples: Vec<String> = (0..rows)
            .map(|_| {
                let slots: Vec<String> = columns
                    .iter()
                    .map(|_| {
                        n += 1;
                        self.placeholder(n)
                    })
                    .collect();
                format!("({})", slots.join(", "))
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote(table),
            names.join(", "),
            tuples.join(", ")
        )
    }

    pub fn list_tables(&self) -> &'static str {
        match self.backend {
            Backend::Postgres => {
                "SELECT CAST(table_name AS TEXT) AS name FROM information_schema.tables \
                 WHERE table_schema = current_schema() ORDER BY table_name"
            },
            Backend::MySql => {
                "SELECT CAST(table_name AS CHAR) AS name FROM information_schema.tables \
                 WHERE table_schema = DATABASE() ORDER BY table_name"
            },
            _ => {
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
            },
        }
    }
}

pub struct SqlExecutor {
    ctx: PipelineContext,
    dsn: String,
    dialect: Dialect,
}

impl SqlExecutor {
    pub fn new(ctx: PipelineContext, dsn: impl Into<String>) -> Self {
        let dsn = dsn.into();
        Self {
            dialect: Dialect::new(Backend::from_dsn(&dsn)),
            ctx,
            dsn,
        }
    }

    /// Executor for the configured `DATABASE_URL`, if there is one.
    pub fn from_context(ctx: &PipelineContext) -> Option<Self> {
        let dsn = ctx.database_url()?.to_string();
        Some(Self::new(ctx.clone(), dsn))
    }

    pub fn backend(&self) -> Backend {
        self.dialect.backend
    }

    /// Replaces one SQL table per entry, named after the cache key without
    /// its stage suffix. Failures are recorded per table.
    pub async fn load_tables(
        &self,
        tables: &BTreeMap<String, Arc<Table>>,
        cancel: &CancellationToken,
    ) -> SqlLoadReport {
        let mut report = SqlLoadReport::default();
        for (key, table) in tables {
            let name = table_name_for_key(key).to_string();
            let timer = self.ctx.metrics.timer(format!("sql_load_{name}"));
            let outcome = self.load_table(&name, Arc::clone(table), cancel).await;
            timer.stop();
            report.record(name, outcome);
        }
        report
    }

    async fn load_table(&self, name: &str, table: Arc<Table>, cancel: &CancellationToken) -> Result<usize> {
        let dialect = self.dialect;
        let name = name.to_string();
        self.ctx
            .pools
            .with_connection(&self.dsn, cancel, move |conn| {
                async move { write_table(conn, dialect, &name, &table).await }.boxed()
            })
            .await
    }

    /// Same as [`load_tables`](Self::load_tables) over one dedicated
    /// connection, bypassing the pool manager.
    pub async fn load_tables_unpooled(&self, tables: &BTreeMap<String, Arc<Table>>) -> SqlLoadReport {
        let mut report = SqlLoadReport::default();
        crate::pool::install_drivers();

        let mut conn = match AnyConnection::connect(&self.dsn).await {
            Ok(conn) => conn,
            Err(e) => {
                let message = format!("Database unreachable at {}: {e}", redact_dsn(&self.dsn));
                for key in tables.keys() {
                    report.record_error(table_name_for_key(key).to_string(), message.clone());
                }
                return report;
            },
        };

        for (key, table) in tables {
            let name = table_name_for_key(key).to_string();
            let outcome = write_table(&mut conn, self.dialect, &name, table).await;
            report.record(name, outcome);
        }

        if let Err(e) = conn.close().await {
            debug!(error = %e, "Closing direct connection failed");
        }
        report
    }

    /// Runs a query and returns its rows as a table. Errors are logged and
    /// turned into `None`.
    pub async fn run_query(&self, sql: &str, label: &str, cancel: &CancellationToken) -> Option<Table> {
        let timer = self.ctx.metrics.timer(format!("query_{label}"));
        let sql = sql.to_string();
        let outcome = self
            .ctx
            .pools
            .with_connection(&self.dsn, cancel, move |conn| {
                async move {
                    let rows = sqlx::query(&sql).fetch_all(conn).await?;
                    Ok::<_, PipelineError>(rows_to_table(&rows)?)
                }
                .boxed()
            })
            .await;

        match outcome {
            Ok(table) => {
                timer.stop();
                debug!(label, rows = table.row_count(), "Query completed");
                Some(table)
            },
            Err(e) => {
                error!(label, error = %e, "Query failed");
                None
            },
        }
    }

    /// Runs several labelled queries on one connection. A failing query maps
    /// to `None` without stopping the rest.
    pub async fn run_batch(
        &self,
        queries: Vec<(String, String)>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, Option<Table>>> {
        self.ctx
            .pools
            .with_connection(&self.dsn, cancel, move |conn| {
                async move {
                    let mut results = BTreeMap::new();
                    for (label, sql) in queries {
                        let table = match sqlx::query(&sql).fetch_all(&mut *conn).await {
                            Ok(rows) => rows_to_table(&rows)
                                .map_err(|e| warn!(label = %label, error = %e, "Unusable result set"))
                                .ok(),
                            Err(e) => {
                                error!(label = %label, error = %e, "Query failed");
                                None
                            },
                        };
                        results.insert(label, table);
                    }
                    Ok::<_, PipelineError>(results)
                }
                .boxed()
            })
            .await
    }

    /// Checks the database with `SELECT 1`.
    pub async fn verify_connection(&self, cancel: &CancellationToken) -> ConnectionStatus {
        let outcome = self
            .ctx
            .pools
            .with_connection(&self.dsn, cancel, |conn| {
                async move {
                    sqlx::query("SELECT 1").execute(conn).await?;
                    Ok::<_, PipelineError>(())
                }
                .boxed()
            })
            .await;

        let error = outcome.err().map(|e| e.to_string());
        if let Some(e) = &error {
            warn!(error = %e, "Database connection check failed");
        }
        ConnectionStatus {
            connected: error.is_none(),
            backend: self.backend(),
            dsn: redact_dsn(&self.dsn),
            error,
        }
    }

    pub async fn list_tables(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let sql = self.dialect.list_tables();
        self.ctx
            .pools
            .with_connection(&self.dsn, cancel, move |conn| {
                async move {
                    let rows = sqlx::query(sql).fetch_all(conn).await?;
                    let names = rows
                        .iter()
                        .map(|row| row.try_get::<String, _>(0))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok::<_, PipelineError>(names)
                }
                .boxed()
            })
            .await
    }

    pub async fn drop_table(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let sql = self.dialect.drop_table(name);
        self.ctx
            .pools
            .with_connection(&self.dsn, cancel, move |conn| {
                async move {
                    sqlx::query(&sql).execute(conn).await?;
                    Ok::<_, PipelineError>(())
                }
                .boxed()
            })
            .await?;
        info!(table = name, "Table dropped");
        Ok(())
    }
}

async fn write_table(conn: &mut AnyConnection, dialect: Dialect, name: &str, table: &Table) -> Result<usize> {
    let columns = table.columns();
    if columns.is_empty() {
        return Err(PipelineError::task(name, "table has no columns"));
    }

    let mut tx = conn.begin().await?;
    sqlx::query(&dialect.drop_table(name)).execute(&mut *tx).await?;
    sqlx::query(&dialect.create_table(name, columns))
        .execute(&mut *tx)
        .await?;

    let rows_per_statement = (MAX_PARAMS_PER_STATEMENT / columns.len()).max(1);
    for chunk in table.rows().chunks(rows_per_statement) {
        let sql = dialect.insert(name, columns, chunk.len());
        let mut query = sqlx::query(&sql);
        for row in chunk {
            for (cell, column) in row.iter().zip(columns) {
                query = bind_cell(query, cell, column.kind);
            }
        }
        query.execute(&mut *tx).await?;
    }

    tx.commit().await?;
    debug!(table = name, rows = table.row_count(), "Table written");
    Ok(table.row_count())
}

fn bind_cell<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    cell: &Value,
    kind: ColumnKind,
) -> Query<'q, Any, AnyArguments<'q>> {
    match kind {
        ColumnKind::Number => query.bind(cell.as_f64()),
        ColumnKind::Text | ColumnKind::Date => {
            query.bind((!cell.is_null()).then(|| cell.to_string()))
        },
    }
}

fn decode_cell(row: &AnyRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Err(_) => return Value::Null,
        Ok(_) => {},
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Value::Number(v as f64);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Value::Number(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return Value::Text(v);
    }
    if let Ok(v) = row.try_get::<bool, _>(idx) {
        return Value::Text(v.to_string());
    }
    Value::Null
}

/// Converts a result set into a table. Columns holding only numbers are
/// numeric; everything else is text.
fn rows_to_table(rows: &[AnyRow]) -> leadflow_common::Result<Table> {
    let Some(first) = rows.first() else {
        return Ok(Table::default());
    };

    let mut seen = HashSet::new();
    let names: Vec<String> = first
        .columns()
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let name = c.name().to_string();
            if seen.insert(name.clone()) {
                name
            } else {
                format!("{name}_{i}")
            }
        })
        .collect();

    let mut cells: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| (0..names.len()).map(|i| decode_cell(row, i)).collect())
        .collect();

    let mut columns = Vec::with_capacity(names.len());
    for (idx, name) in names.into_iter().enumerate() {
        let numeric = cells.iter().any(|r| !r[idx].is_null())
            && cells
                .iter()
                .all(|r| r[idx].is_null() || matches!(r[idx], Value::Number(_)));
        if numeric {
            columns.push(Column::number(name));
        } else {
            for row in &mut cells {
                if let Value::Number(n) = row[idx] {
                    row[idx] = Value::Text(n.to_string());
                }
            }
            columns.push(Column::text(name));
        }
    }

    Table::from_rows(columns, cells)
}
