//! SQLite persistence for APM data
//!
//! This module provides async database operations with:
//! - Connection pooling
//! - Automatic migrations
//! - Idempotent create-if-absent writes keyed by correlation id
//! - WAL mode for concurrent reads/writes

pub mod aggregate;
pub mod entities;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use crate::context::current_millis;
use entities::{
    ApiRequest, ApiResponse, ErrorTrace, Integration, NotificationReceiver, ReceiverKind,
    RequestLogRecord, TraceDetail,
};

/// APM database handle
///
/// Manages the SQLite connection pool and provides the narrow operation set
/// the pipeline needs. Writes on the request path are keyed by correlation id
/// and are safe to repeat.
#[derive(Debug, Clone)]
pub struct ApmStore {
    pool: SqlitePool,
}

impl ApmStore {
    /// Connect and migrate
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite database URL (e.g., "sqlite:tracevault.db")
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("synchronous", "NORMAL")
            .pragma("foreign_keys", "ON");

        // An in-memory database exists per connection, so the pool must not
        // open a second one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .context("Failed to connect to APM database")?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .context("Failed to run APM database migrations")?;

        tracing::info!("APM database migrations completed");
        Ok(())
    }

    /// Insert a request row unless one with the same correlation id exists.
    /// Returns whether a row was actually inserted.
    pub async fn create_request_if_absent(&self, req: &ApiRequest) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO api_requests
                (id, headers, query_parameters, query_string, handler, method, path, user_id, requested_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&req.id)
        .bind(&req.headers)
        .bind(&req.query_parameters)
        .bind(&req.query_string)
        .bind(&req.handler)
        .bind(&req.method)
        .bind(&req.path)
        .bind(&req.user_id)
        .bind(req.requested_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert a response row unless the request already has one.
    /// Returns whether a row was actually inserted.
    pub async fn create_response_if_absent(&self, resp: &ApiResponse) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO api_responses (request_id, status_code, elapsed_ms, body, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(request_id) DO NOTHING",
        )
        .bind(&resp.request_id)
        .bind(resp.status_code as i64)
        .bind(resp.elapsed_ms as i64)
        .bind(&resp.body)
        .bind(resp.created_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert a trace row unless the request already has one.
    /// Returns whether a row was actually inserted.
    pub async fn create_trace_if_absent(&self, trace: &ErrorTrace) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO error_traces
                (request_id, payload, exception_class, exception_args, traceback, created_at, dismissed_at, dismissed_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(request_id) DO NOTHING",
        )
        .bind(&trace.request_id)
        .bind(&trace.payload)
        .bind(&trace.exception_class)
        .bind(&trace.exception_args)
        .bind(&trace.traceback)
        .bind(trace.created_at as i64)
        .bind(trace.dismissed_at.map(|t| t as i64))
        .bind(&trace.dismissed_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert captured log records in a single transaction, preserving order
    pub async fn insert_logs_batch(&self, logs: &[RequestLogRecord]) -> Result<(), sqlx::Error> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for log in logs {
            sqlx::query(
                "INSERT INTO request_logs (trace_id, level, file_path, func_name, timestamp, message)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&log.trace_id)
            .bind(&log.level)
            .bind(&log.file_path)
            .bind(&log.func_name)
            .bind(log.timestamp as i64)
            .bind(&log.message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<ApiRequest>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, headers, query_parameters, query_string, handler, method, path, user_id, requested_at
             FROM api_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ApiRequest {
            id: row.get("id"),
            headers: row.get("headers"),
            query_parameters: row.get("query_parameters"),
            query_string: row.get("query_string"),
            handler: row.get("handler"),
            method: row.get("method"),
            path: row.get("path"),
            user_id: row.get("user_id"),
            requested_at: row.get::<i64, _>("requested_at") as u64,
        }))
    }

    pub async fn get_response(&self, request_id: &str) -> Result<Option<ApiResponse>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT request_id, status_code, elapsed_ms, body, created_at
             FROM api_responses WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ApiResponse {
            request_id: row.get("request_id"),
            status_code: row.get::<i64, _>("status_code") as u16,
            elapsed_ms: row.get::<i64, _>("elapsed_ms") as u64,
            body: row.get("body"),
            created_at: row.get::<i64, _>("created_at") as u64,
        }))
    }

    pub async fn get_trace(&self, request_id: &str) -> Result<Option<ErrorTrace>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT request_id, payload, exception_class, exception_args, traceback, created_at, dismissed_at, dismissed_by
             FROM error_traces WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(trace_from_row))
    }

    /// Logs attached to a trace, in the order they were captured
    pub async fn logs_for_trace(
        &self,
        trace_id: &str,
    ) -> Result<Vec<RequestLogRecord>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT trace_id, level, file_path, func_name, timestamp, message
             FROM request_logs WHERE trace_id = ? ORDER BY id ASC",
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RequestLogRecord {
                trace_id: row.get("trace_id"),
                level: row.get("level"),
                file_path: row.get("file_path"),
                func_name: row.get("func_name"),
                timestamp: row.get::<i64, _>("timestamp") as u64,
                message: row.get("message"),
            })
            .collect())
    }

    /// Load a trace together with its request and logs. None while any part
    /// is not yet visible.
    pub async fn get_trace_detail(&self, id: &str) -> Result<Option<TraceDetail>, sqlx::Error> {
        let Some(trace) = self.get_trace(id).await? else {
            return Ok(None);
        };
        let Some(request) = self.get_request(id).await? else {
            return Ok(None);
        };
        let logs = self.logs_for_trace(id).await?;

        Ok(Some(TraceDetail {
            trace,
            request,
            logs,
        }))
    }

    pub async fn list_integrations(&self) -> Result<Vec<Integration>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, platform, token, created_by FROM integrations ORDER BY platform ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Integration {
                id: row.get("id"),
                platform: row.get("platform"),
                token: row.get("token"),
                created_by: row.get("created_by"),
            })
            .collect())
    }

    pub async fn receivers_for(
        &self,
        integration_id: i64,
    ) -> Result<Vec<NotificationReceiver>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, integration_id, kind, target
             FROM notification_receivers WHERE integration_id = ? ORDER BY id ASC",
        )
        .bind(integration_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| NotificationReceiver {
                id: row.get("id"),
                integration_id: row.get("integration_id"),
                kind: ReceiverKind::parse(row.get::<String, _>("kind").as_str()),
                target: row.get("target"),
            })
            .collect())
    }

    /// Register a platform integration (operator setup). The platform column
    /// is unique; configuring the same platform twice is an error.
    pub async fn add_integration(
        &self,
        platform: &str,
        token: &str,
        created_by: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO integrations (platform, token, created_by) VALUES (?, ?, ?)",
        )
        .bind(platform)
        .bind(token)
        .bind(created_by)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn add_receiver(
        &self,
        integration_id: i64,
        kind: ReceiverKind,
        target: &str,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO notification_receivers (integration_id, kind, target) VALUES (?, ?, ?)",
        )
        .bind(integration_id)
        .bind(kind.as_str())
        .bind(target)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Dismiss traces in bulk. Only traces that are still open get stamped;
    /// the returned count is the number actually dismissed.
    pub async fn dismiss_traces(
        &self,
        ids: &[String],
        dismissed_by: &str,
    ) -> Result<u64, sqlx::Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE error_traces SET dismissed_at = ?, dismissed_by = ?
             WHERE request_id IN ({}) AND dismissed_at IS NULL",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(current_millis() as i64)
            .bind(dismissed_by);
        for id in ids {
            query = query.bind(id);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Get the underlying connection pool (for advanced usage)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn trace_from_row(row: sqlx::sqlite::SqliteRow) -> ErrorTrace {
    ErrorTrace {
        request_id: row.get("request_id"),
        payload: row.get("payload"),
        exception_class: row.get("exception_class"),
        exception_args: row.get("exception_args"),
        traceback: row.get("traceback"),
        created_at: row.get::<i64, _>("created_at") as u64,
        dismissed_at: row.get::<Option<i64>, _>("dismissed_at").map(|t| t as u64),
        dismissed_by: row.get("dismissed_by"),
    }
}
