//! Metrics recorder
//!
//! Persists the request/response pair for every instrumented request. Writes
//! are keyed by correlation id and safe to repeat. Storage problems are
//! logged and absorbed here; recording must never change what the client
//! receives.

use axum::body::{to_bytes, Body};
use axum::response::Response;

use crate::context::{current_millis, CorrelationContext};
use crate::metrics;
use crate::store::entities::{ApiRequest, ApiResponse};
use crate::store::ApmStore;

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    store: ApmStore,
}

impl MetricsRecorder {
    pub fn new(store: ApmStore) -> Self {
        Self { store }
    }

    /// Record a completed request. Error statuses get their body
    /// snapshotted, which requires buffering; success bodies pass through
    /// untouched.
    pub async fn record_success(&self, ctx: &CorrelationContext, response: Response) -> Response {
        let status = response.status().as_u16();
        let elapsed_ms = ctx.elapsed_ms();

        let (response, body_snapshot) = if status >= 400 {
            buffer_error_body(response).await
        } else {
            (response, None)
        };

        let row = ApiResponse {
            request_id: ctx.request_id.clone(),
            status_code: status,
            elapsed_ms,
            body: body_snapshot,
            created_at: current_millis(),
        };

        if let Err(err) = self.persist(ctx, &row).await {
            tracing::error!(
                request_id = %ctx.request_id,
                error = %err,
                "Failed to record request metrics"
            );
        }

        metrics::record_request(&ctx.handler.qualified(), "completed", elapsed_ms);

        response
    }

    /// Record a failed request: a fixed 500 response row, elapsed measured
    /// from the same tag-time start the success path uses.
    pub async fn record_failure(&self, ctx: &CorrelationContext) {
        let elapsed_ms = ctx.elapsed_ms();

        let row = ApiResponse {
            request_id: ctx.request_id.clone(),
            status_code: 500,
            elapsed_ms,
            body: None,
            created_at: current_millis(),
        };

        if let Err(err) = self.persist(ctx, &row).await {
            tracing::error!(
                request_id = %ctx.request_id,
                error = %err,
                "Failed to record failure metrics"
            );
        }

        metrics::record_request(&ctx.handler.qualified(), "failed", elapsed_ms);
    }

    async fn persist(
        &self,
        ctx: &CorrelationContext,
        row: &ApiResponse,
    ) -> Result<(), sqlx::Error> {
        self.store
            .create_request_if_absent(&request_row(ctx))
            .await?;
        self.store.create_response_if_absent(row).await?;
        Ok(())
    }
}

/// Build the request row from the tag-time snapshot
pub(crate) fn request_row(ctx: &CorrelationContext) -> ApiRequest {
    let snap = &ctx.snapshot;
    ApiRequest {
        id: ctx.request_id.clone(),
        headers: snap
            .headers
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok()),
        query_parameters: snap
            .query_parameters
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok()),
        query_string: snap.query_string.clone(),
        handler: ctx.handler.qualified(),
        method: snap.method.clone(),
        path: snap.path.clone(),
        user_id: snap.user_id.clone(),
        requested_at: ctx.tagged_at,
    }
}

/// Buffer an error response body and keep it only if it is structured JSON.
/// The rebuilt response carries the same bytes either way.
async fn buffer_error_body(response: Response) -> (Response, Option<String>) {
    let (parts, body) = response.into_parts();

    match to_bytes(body, usize::MAX).await {
        Ok(bytes) => {
            let snapshot = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| serde_json::to_string(&v).ok());
            (Response::from_parts(parts, Body::from(bytes)), snapshot)
        }
        Err(err) => {
            tracing::warn!(error = %err, "Could not buffer error response body");
            (Response::from_parts(parts, Body::empty()), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::context::HandlerKind;
    use axum::http::Request;

    fn test_context() -> CorrelationContext {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("/api/polls?page=1")
            .body(())
            .unwrap()
            .into_parts();

        CorrelationContext::tag(
            &CaptureConfig::default(),
            HandlerKind::Mediated,
            "demo::polls::create_poll",
            &parts,
            br#"{"question":"?"}"#,
        )
    }

    async fn test_recorder() -> (MetricsRecorder, ApmStore) {
        let store = ApmStore::connect("sqlite::memory:").await.unwrap();
        (MetricsRecorder::new(store.clone()), store)
    }

    fn response_with(status: u16, body: &str) -> Response {
        Response::builder()
            .status(status)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_persists_request_and_response() {
        let (recorder, store) = test_recorder().await;
        let ctx = test_context();

        let response = recorder
            .record_success(&ctx, response_with(200, r#"{"ok":true}"#))
            .await;
        assert_eq!(response.status(), 200);

        let req = store.get_request(&ctx.request_id).await.unwrap().unwrap();
        assert_eq!(req.handler, "demo.mediated.create_poll");
        assert_eq!(req.method, "POST");
        assert_eq!(req.query_string.as_deref(), Some("page=1"));

        let resp = store.get_response(&ctx.request_id).await.unwrap().unwrap();
        assert_eq!(resp.status_code, 200);
        // Success bodies are never snapshotted
        assert!(resp.body.is_none());
    }

    #[tokio::test]
    async fn test_error_status_snapshots_json_body() {
        let (recorder, store) = test_recorder().await;
        let ctx = test_context();

        let response = recorder
            .record_success(&ctx, response_with(422, r#"{"detail":"bad poll"}"#))
            .await;

        // The client still gets the original bytes
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], br#"{"detail":"bad poll"}"#);

        let resp = store.get_response(&ctx.request_id).await.unwrap().unwrap();
        assert_eq!(resp.status_code, 422);
        assert_eq!(resp.body.as_deref(), Some(r#"{"detail":"bad poll"}"#));
    }

    #[tokio::test]
    async fn test_error_status_with_non_json_body_stores_null() {
        let (recorder, store) = test_recorder().await;
        let ctx = test_context();

        recorder
            .record_success(&ctx, response_with(500, "<html>oops</html>"))
            .await;

        let resp = store.get_response(&ctx.request_id).await.unwrap().unwrap();
        assert!(resp.body.is_none());
    }

    #[tokio::test]
    async fn test_failure_records_fixed_500() {
        let (recorder, store) = test_recorder().await;
        let ctx = test_context();

        recorder.record_failure(&ctx).await;

        let resp = store.get_response(&ctx.request_id).await.unwrap().unwrap();
        assert_eq!(resp.status_code, 500);
        assert!(resp.body.is_none());
    }

    #[tokio::test]
    async fn test_recording_twice_keeps_first_row() {
        let (recorder, store) = test_recorder().await;
        let ctx = test_context();

        recorder.record_failure(&ctx).await;
        recorder
            .record_success(&ctx, response_with(200, "ok"))
            .await;

        let resp = store.get_response(&ctx.request_id).await.unwrap().unwrap();
        assert_eq!(resp.status_code, 500);
    }
}
