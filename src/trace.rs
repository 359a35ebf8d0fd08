//! Error capture
//!
//! On a failed request the pipeline writes the trace row, keyed by the
//! correlation id, and persists the captured logs exactly once, when the
//! trace insert actually created the row. Repeating the capture for the same
//! request is a silent no-op.

use crate::context::{current_millis, CorrelationContext};
use crate::metrics;
use crate::outcome::CapturedFailure;
use crate::recorder::request_row;
use crate::store::entities::{ErrorTrace, RequestLogRecord};
use crate::store::ApmStore;

#[derive(Debug, Clone)]
pub struct ErrorCapture {
    store: ApmStore,
}

impl ErrorCapture {
    pub fn new(store: ApmStore) -> Self {
        Self { store }
    }

    /// Persist the trace for a failed request and return the trace id (the
    /// correlation id). Storage errors propagate to the caller.
    pub async fn record(
        &self,
        ctx: &CorrelationContext,
        failure: &CapturedFailure,
    ) -> Result<String, sqlx::Error> {
        self.store
            .create_request_if_absent(&request_row(ctx))
            .await?;

        let trace = ErrorTrace {
            request_id: ctx.request_id.clone(),
            payload: ctx
                .snapshot
                .payload
                .as_ref()
                .and_then(|v| serde_json::to_string(v).ok()),
            exception_class: failure.exception_class.clone(),
            exception_args: failure.exception_args.clone(),
            traceback: failure.traceback.clone(),
            created_at: current_millis(),
            dismissed_at: None,
            dismissed_by: None,
        };

        let inserted = self.store.create_trace_if_absent(&trace).await?;

        // Log snapshots belong to the trace insert that won; a repeat capture
        // must not duplicate or reorder them.
        if inserted {
            let logs: Vec<RequestLogRecord> = ctx
                .logger
                .flush()
                .into_iter()
                .map(|record| RequestLogRecord {
                    trace_id: ctx.request_id.clone(),
                    level: record.level.as_str().to_string(),
                    file_path: record.file_path,
                    func_name: record.func_name,
                    timestamp: record.timestamp,
                    message: record.message,
                })
                .collect();
            self.store.insert_logs_batch(&logs).await?;

            metrics::record_trace(&trace.exception_class);
        }

        Ok(ctx.request_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::context::HandlerKind;
    use axum::http::Request;

    fn failing_context() -> CorrelationContext {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("/api/polls")
            .body(())
            .unwrap()
            .into_parts();

        CorrelationContext::tag(
            &CaptureConfig::default(),
            HandlerKind::Mediated,
            "demo::polls::create_poll",
            &parts,
            br#"{"question":"what?"}"#,
        )
    }

    fn sample_failure() -> CapturedFailure {
        CapturedFailure::from_parts("ValueError", "bad poll", "line 1\nline 2")
    }

    #[tokio::test]
    async fn test_record_persists_trace_with_payload_and_logs() {
        let store = ApmStore::connect("sqlite::memory:").await.unwrap();
        let capture = ErrorCapture::new(store.clone());
        let ctx = failing_context();

        ctx.logger.info("validating poll");
        ctx.logger.error("validation blew up");

        let trace_id = capture.record(&ctx, &sample_failure()).await.unwrap();
        assert_eq!(trace_id, ctx.request_id);

        let trace = store.get_trace(&trace_id).await.unwrap().unwrap();
        assert_eq!(trace.exception_class, "ValueError");
        assert_eq!(trace.exception_args, "bad poll");
        assert!(trace.payload.unwrap().contains("what?"));

        let logs = store.logs_for_trace(&trace_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "validating poll");
        assert_eq!(logs[0].level, "INFO");
        assert_eq!(logs[1].message, "validation blew up");
        assert_eq!(logs[1].func_name, "create_poll");
    }

    #[tokio::test]
    async fn test_repeat_capture_is_a_no_op() {
        let store = ApmStore::connect("sqlite::memory:").await.unwrap();
        let capture = ErrorCapture::new(store.clone());
        let ctx = failing_context();

        ctx.logger.info("only once");
        capture.record(&ctx, &sample_failure()).await.unwrap();

        // Second capture for the same request: different class, new logs
        ctx.logger.info("should not be stored");
        let other = CapturedFailure::from_parts("KeyError", "other", "t");
        capture.record(&ctx, &other).await.unwrap();

        let trace = store.get_trace(&ctx.request_id).await.unwrap().unwrap();
        assert_eq!(trace.exception_class, "ValueError");

        let logs = store.logs_for_trace(&ctx.request_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "only once");
    }

    #[tokio::test]
    async fn test_request_row_created_when_recorder_has_not_run() {
        let store = ApmStore::connect("sqlite::memory:").await.unwrap();
        let capture = ErrorCapture::new(store.clone());
        let ctx = failing_context();

        capture.record(&ctx, &sample_failure()).await.unwrap();

        let req = store.get_request(&ctx.request_id).await.unwrap().unwrap();
        assert_eq!(req.handler, "demo.mediated.create_poll");
    }
}
