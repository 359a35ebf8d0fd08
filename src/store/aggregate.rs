//! Operator metric datasets
//!
//! Six read-only aggregates backing the operator API. Each returns a keyed
//! JSON object whose keys stay in insertion order, so chart clients can
//! render them without re-sorting.

use chrono::{Timelike, Utc};
use serde_json::{json, Map, Value};
use sqlx::Row;
use std::collections::HashMap;

use super::ApmStore;

/// Unix ms of UTC midnight `days` days ago. Day-bucketed windows include the
/// whole first day.
fn midnight_ms_days_ago(days: u64) -> i64 {
    let day = Utc::now().date_naive() - chrono::Days::new(days);
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

impl ApmStore {
    /// Request and error counts per day, trailing week
    ///
    /// Shape: `{"requests": {day: n}, "errors": {day: n}}`, days ascending.
    pub async fn requests_by_day(&self) -> Result<Value, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT date(r.requested_at / 1000, 'unixepoch') AS day,
                    COUNT(r.id) AS requests,
                    COUNT(t.request_id) AS errors
             FROM api_requests r
             LEFT JOIN error_traces t ON t.request_id = r.id
             WHERE r.requested_at >= ?
             GROUP BY day
             ORDER BY day ASC",
        )
        .bind(midnight_ms_days_ago(7))
        .fetch_all(self.pool())
        .await?;

        let mut requests = Map::new();
        let mut errors = Map::new();
        for row in rows {
            let day: String = row.get("day");
            requests.insert(day.clone(), json!(row.get::<i64, _>("requests")));
            errors.insert(day, json!(row.get::<i64, _>("errors")));
        }

        Ok(json!({ "requests": requests, "errors": errors }))
    }

    /// Request and error counts per handler, today only
    ///
    /// Shape: `{"requests": {handler: n}, "errors": {handler: n}}`.
    pub async fn requests_by_handler_today(&self) -> Result<Value, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT r.handler AS handler,
                    COUNT(r.id) AS requests,
                    COUNT(t.request_id) AS errors
             FROM api_requests r
             LEFT JOIN error_traces t ON t.request_id = r.id
             WHERE r.requested_at >= ?
             GROUP BY r.handler
             ORDER BY r.handler ASC",
        )
        .bind(midnight_ms_days_ago(0))
        .fetch_all(self.pool())
        .await?;

        let mut requests = Map::new();
        let mut errors = Map::new();
        for row in rows {
            let handler: String = row.get("handler");
            requests.insert(handler.clone(), json!(row.get::<i64, _>("requests")));
            errors.insert(handler, json!(row.get::<i64, _>("errors")));
        }

        Ok(json!({ "requests": requests, "errors": errors }))
    }

    /// Response latency per handler, trailing week
    ///
    /// Shape: `{"avg": {handler: ms}, "max": {handler: ms}, "min": {handler: ms}}`.
    pub async fn latency_by_handler(&self) -> Result<Value, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT r.handler AS handler,
                    AVG(p.elapsed_ms) AS avg_ms,
                    MAX(p.elapsed_ms) AS max_ms,
                    MIN(p.elapsed_ms) AS min_ms
             FROM api_responses p
             JOIN api_requests r ON r.id = p.request_id
             WHERE r.requested_at >= ?
             GROUP BY r.handler
             ORDER BY r.handler ASC",
        )
        .bind(midnight_ms_days_ago(7))
        .fetch_all(self.pool())
        .await?;

        let mut avg = Map::new();
        let mut max = Map::new();
        let mut min = Map::new();
        for row in rows {
            let handler: String = row.get("handler");
            avg.insert(handler.clone(), json!(row.get::<f64, _>("avg_ms")));
            max.insert(handler.clone(), json!(row.get::<i64, _>("max_ms")));
            min.insert(handler, json!(row.get::<i64, _>("min_ms")));
        }

        Ok(json!({ "avg": avg, "max": max, "min": min }))
    }

    /// Response latency per day, trailing week
    ///
    /// Shape: `{"avg": {day: ms}, "max": {day: ms}, "min": {day: ms}}`, days
    /// ascending.
    pub async fn latency_by_day(&self) -> Result<Value, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT date(r.requested_at / 1000, 'unixepoch') AS day,
                    AVG(p.elapsed_ms) AS avg_ms,
                    MAX(p.elapsed_ms) AS max_ms,
                    MIN(p.elapsed_ms) AS min_ms
             FROM api_responses p
             JOIN api_requests r ON r.id = p.request_id
             WHERE r.requested_at >= ?
             GROUP BY day
             ORDER BY day ASC",
        )
        .bind(midnight_ms_days_ago(7))
        .fetch_all(self.pool())
        .await?;

        let mut avg = Map::new();
        let mut max = Map::new();
        let mut min = Map::new();
        for row in rows {
            let day: String = row.get("day");
            avg.insert(day.clone(), json!(row.get::<f64, _>("avg_ms")));
            max.insert(day.clone(), json!(row.get::<i64, _>("max_ms")));
            min.insert(day, json!(row.get::<i64, _>("min_ms")));
        }

        Ok(json!({ "avg": avg, "max": max, "min": min }))
    }

    /// Request counts per hour for the trailing 24 hours
    ///
    /// Every hour bucket appears, zero-filled, keyed "HH:00", oldest first.
    pub async fn requests_by_hour(&self) -> Result<Value, sqlx::Error> {
        let now = Utc::now();
        let window_start = now - chrono::Duration::hours(23);

        let rows = sqlx::query(
            "SELECT CAST(strftime('%H', requested_at / 1000, 'unixepoch') AS INTEGER) AS hour,
                    COUNT(*) AS requests
             FROM api_requests
             WHERE requested_at >= ?
             GROUP BY hour",
        )
        .bind(window_start.timestamp_millis())
        .fetch_all(self.pool())
        .await?;

        let counts: HashMap<u32, i64> = rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<i64, _>("hour") as u32,
                    row.get::<i64, _>("requests"),
                )
            })
            .collect();

        // Walk the window chronologically: the tail of yesterday, then today
        // up to the current hour.
        let mut output = Map::new();
        for hour in window_start.hour()..24 {
            output.insert(
                format!("{:02}:00", hour),
                json!(counts.get(&hour).copied().unwrap_or(0)),
            );
        }
        for hour in 0..=now.hour() {
            output.insert(
                format!("{:02}:00", hour),
                json!(counts.get(&hour).copied().unwrap_or(0)),
            );
        }

        Ok(Value::Object(output))
    }

    /// Error counts per exception class, trailing week
    pub async fn errors_by_class(&self) -> Result<Value, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT exception_class, COUNT(request_id) AS errors
             FROM error_traces
             WHERE created_at >= ?
             GROUP BY exception_class
             ORDER BY exception_class ASC",
        )
        .bind(midnight_ms_days_ago(7))
        .fetch_all(self.pool())
        .await?;

        let mut output = Map::new();
        for row in rows {
            output.insert(
                row.get::<String, _>("exception_class"),
                json!(row.get::<i64, _>("errors")),
            );
        }

        Ok(Value::Object(output))
    }
}
