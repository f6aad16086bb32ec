//! SQLite audit store

use super::AuditStore;
use crate::error::Result;
use crate::types::{AuditFilter, AuditRecord, Page, PageRequest};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Relational store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_url() -> String {
    "sqlite://audit.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            max_connections: default_max_connections(),
        }
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id TEXT NOT NULL,
        username TEXT NOT NULL,
        operation TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        class_name TEXT NOT NULL DEFAULT '',
        method_name TEXT NOT NULL DEFAULT '',
        args TEXT NOT NULL DEFAULT '',
        elapsed_time INTEGER NOT NULL DEFAULT 0,
        create_time INTEGER NOT NULL,
        uri TEXT,
        http_method TEXT,
        ip TEXT,
        username_key TEXT NOT NULL DEFAULT '',
        operation_key TEXT NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_audit_log_create_time ON audit_log (create_time)",
    "CREATE INDEX IF NOT EXISTS idx_audit_log_trace_id ON audit_log (trace_id)",
];

const COLUMNS: &str = "id, trace_id, username, operation, description, class_name, \
     method_name, args, elapsed_time, create_time, uri, http_method, ip";

/// Lowercased copy used for keyword matching
///
/// SQLite's `LOWER()` folds ASCII only, so keyword columns are folded here.
fn search_key(value: &str) -> String {
    value.to_lowercase()
}

/// WHERE clause and bind values for a filter
struct FilterClause {
    sql: String,
    pattern: Option<String>,
    start: Option<i64>,
    end: Option<i64>,
}

impl FilterClause {
    fn new(filter: &AuditFilter) -> Self {
        let mut conditions = vec!["1=1"];
        let pattern = filter.keyword.as_ref().map(|k| {
            conditions.push(
                "(username_key LIKE ? ESCAPE '\\' OR operation_key LIKE ? ESCAPE '\\')",
            );
            format!("%{}%", escape_like(&search_key(k)))
        });
        let start = filter.start_time.map(|t| {
            conditions.push("create_time >= ?");
            t.timestamp_millis()
        });
        let end = filter.end_time.map(|t| {
            conditions.push("create_time <= ?");
            t.timestamp_millis()
        });

        Self {
            sql: conditions.join(" AND "),
            pattern,
            start,
            end,
        }
    }

    /// Bind in the same order the conditions were pushed
    fn bind<'q>(&self, mut query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        if let Some(ref pattern) = self.pattern {
            query = query.bind(pattern.clone()).bind(pattern.clone());
        }
        if let Some(start) = self.start {
            query = query.bind(start);
        }
        if let Some(end) = self.end {
            query = query.bind(end);
        }
        query
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn row_to_record(row: &SqliteRow) -> AuditRecord {
    let elapsed: i64 = row.get("elapsed_time");
    let create_time: i64 = row.get("create_time");
    AuditRecord {
        id: Some(row.get("id")),
        trace_id: row.get("trace_id"),
        username: row.get("username"),
        operation: row.get("operation"),
        description: row.get("description"),
        class_name: row.get("class_name"),
        method_name: row.get("method_name"),
        args: row.get("args"),
        elapsed_time: u64::try_from(elapsed).unwrap_or(0),
        create_time: Utc
            .timestamp_millis_opt(create_time)
            .single()
            .unwrap_or_default(),
        uri: row.get("uri"),
        http_method: row.get("http_method"),
        ip: row.get("ip"),
    }
}

/// Whether a database error is worth retrying
pub fn is_transient_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_lowercase();
            msg.contains("busy") || msg.contains("locked") || msg.contains("timeout")
        }
        _ => false,
    }
}

/// Audit store on a SQLite pool
#[derive(Clone)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool from config and create the schema
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        tracing::info!(url = %config.url, "Connected to audit database");

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the table and indexes if missing
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    #[tracing::instrument(skip(self, record), fields(trace_id = %record.trace_id))]
    async fn insert(&self, record: &AuditRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (
                trace_id, username, operation, description, class_name,
                method_name, args, elapsed_time, create_time, uri, http_method, ip,
                username_key, operation_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.trace_id)
        .bind(&record.username)
        .bind(&record.operation)
        .bind(&record.description)
        .bind(&record.class_name)
        .bind(&record.method_name)
        .bind(&record.args)
        .bind(i64::try_from(record.elapsed_time).unwrap_or(i64::MAX))
        .bind(record.create_time.timestamp_millis())
        .bind(&record.uri)
        .bind(&record.http_method)
        .bind(&record.ip)
        .bind(search_key(&record.username))
        .bind(search_key(&record.operation))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_transient_error(&e) {
                tracing::warn!(error = %e, "Transient audit insert failure");
            }
            e
        })?;

        Ok(result.last_insert_rowid())
    }

    async fn search(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditRecord>> {
        let clause = FilterClause::new(filter);
        let sql = format!(
            "SELECT {} FROM audit_log WHERE {} ORDER BY create_time DESC, id DESC LIMIT ?",
            COLUMNS, clause.sql
        );

        let query = clause
            .bind(sqlx::query(&sql))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX));
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn page(&self, filter: &AuditFilter, request: PageRequest) -> Result<Page<AuditRecord>> {
        let clause = FilterClause::new(filter);

        let count_sql = format!("SELECT COUNT(*) AS cnt FROM audit_log WHERE {}", clause.sql);
        let count_row = clause
            .bind(sqlx::query(&count_sql))
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = count_row.get("cnt");

        let data_sql = format!(
            "SELECT {} FROM audit_log WHERE {} ORDER BY create_time DESC, id DESC LIMIT ? OFFSET ?",
            COLUMNS, clause.sql
        );
        let rows = clause
            .bind(sqlx::query(&data_sql))
            .bind(i64::from(request.size))
            .bind(i64::try_from(request.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            items: rows.iter().map(row_to_record).collect(),
            page: request.page,
            size: request.size,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
