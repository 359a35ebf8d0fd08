//! Pipeline assembly
//!
//! `Apm` wires the tagger, recorder, error capture and notification dispatch
//! into adapters that wrap axum handlers:
//!
//! ```text
//! request -> tag -> handler -> Completed -> recorder (request + response rows)
//!                           -> Failed    -> recorder (500 row)
//!                                        -> error capture (trace + logs)
//!                                        -> dispatch (inline or queued)
//!                                        -> JSON 500 with the correlation id
//! ```
//!
//! Wrapped handlers receive an `ApmContext` (correlation id + request
//! logger) as an argument and return an explicit `HandlerOutcome`; nothing
//! is smuggled through request extensions. Instrumentation failures are
//! absorbed so they can never change what the client receives, and routes
//! that are not wrapped never touch the pipeline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::{to_bytes, Body, Bytes};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::capture::RequestLogger;
use crate::config::Config;
use crate::context::{CorrelationContext, HandlerKind};
use crate::notify::{Dispatcher, NotifyQueue};
use crate::outcome::{CapturedFailure, HandlerOutcome};
use crate::recorder::MetricsRecorder;
use crate::store::ApmStore;
use crate::trace::ErrorCapture;

/// Handler-facing slice of the correlation context
#[derive(Debug, Clone)]
pub struct ApmContext {
    pub request_id: String,
    pub logger: RequestLogger,
}

/// Class-style instrumented handler. The handler name is derived from the
/// implementing type, not from the dispatch closure.
#[async_trait::async_trait]
pub trait ApmEndpoint: Send + Sync + 'static {
    async fn handle(&self, ctx: ApmContext, request: Request) -> HandlerOutcome;
}

/// Boxed response future returned by the instrument adapters
pub type AdapterFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Cheap-clone pipeline handle shared across routes
#[derive(Clone)]
pub struct Apm {
    config: Arc<ArcSwap<Config>>,
    store: ApmStore,
    recorder: MetricsRecorder,
    capture: ErrorCapture,
    dispatcher: Arc<Dispatcher>,
    queue: Option<NotifyQueue>,
}

impl Apm {
    pub fn new(
        config: Arc<ArcSwap<Config>>,
        store: ApmStore,
        dispatcher: Arc<Dispatcher>,
        queue: Option<NotifyQueue>,
    ) -> Self {
        Self {
            recorder: MetricsRecorder::new(store.clone()),
            capture: ErrorCapture::new(store.clone()),
            config,
            store,
            dispatcher,
            queue,
        }
    }

    pub fn store(&self) -> &ApmStore {
        &self.store
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Wrap a plain handler. The payload snapshot reads the body as
    /// urlencoded form fields.
    pub fn direct<F, Fut>(
        &self,
        handler: F,
    ) -> impl Fn(Request) -> AdapterFuture + Clone + Send + Sync + 'static
    where
        F: Fn(ApmContext, Request) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        let type_path = std::any::type_name_of_val(&handler);
        self.adapter(HandlerKind::Direct, type_path, handler)
    }

    /// Wrap a JSON API handler. The payload snapshot reads the body as JSON.
    pub fn api<F, Fut>(
        &self,
        handler: F,
    ) -> impl Fn(Request) -> AdapterFuture + Clone + Send + Sync + 'static
    where
        F: Fn(ApmContext, Request) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        let type_path = std::any::type_name_of_val(&handler);
        self.adapter(HandlerKind::Mediated, type_path, handler)
    }

    /// Wrap a class-style handler with a Direct snapshot
    pub fn endpoint<E: ApmEndpoint>(
        &self,
        endpoint: E,
    ) -> impl Fn(Request) -> AdapterFuture + Clone + Send + Sync + 'static {
        self.endpoint_adapter(HandlerKind::Direct, endpoint)
    }

    /// Wrap a class-style handler with a Mediated (JSON) snapshot
    pub fn api_endpoint<E: ApmEndpoint>(
        &self,
        endpoint: E,
    ) -> impl Fn(Request) -> AdapterFuture + Clone + Send + Sync + 'static {
        self.endpoint_adapter(HandlerKind::Mediated, endpoint)
    }

    fn endpoint_adapter<E: ApmEndpoint>(
        &self,
        kind: HandlerKind,
        endpoint: E,
    ) -> impl Fn(Request) -> AdapterFuture + Clone + Send + Sync + 'static {
        let type_path = std::any::type_name::<E>();
        let endpoint = Arc::new(endpoint);
        self.adapter(kind, type_path, move |ctx, request| {
            let endpoint = endpoint.clone();
            async move { endpoint.handle(ctx, request).await }
        })
    }

    fn adapter<F, Fut>(
        &self,
        kind: HandlerKind,
        type_path: &'static str,
        handler: F,
    ) -> impl Fn(Request) -> AdapterFuture + Clone + Send + Sync + 'static
    where
        F: Fn(ApmContext, Request) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        let apm = self.clone();
        move |request: Request| {
            let apm = apm.clone();
            let handler = handler.clone();
            Box::pin(async move { apm.run(kind, type_path, request, handler).await })
        }
    }

    async fn run<F, Fut>(
        &self,
        kind: HandlerKind,
        type_path: &str,
        request: Request,
        handler: F,
    ) -> Response
    where
        F: Fn(ApmContext, Request) -> Fut,
        Fut: Future<Output = HandlerOutcome>,
    {
        let config = self.config.load_full();

        // Buffer the body up front: the snapshot and the handler both read it
        let (parts, body) = request.into_parts();
        let bytes = match to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to buffer request body, snapshot will be empty");
                Bytes::new()
            }
        };

        let ctx = CorrelationContext::tag(&config.capture, kind, type_path, &parts, &bytes);
        let request = Request::from_parts(parts, Body::from(bytes));

        let apm_ctx = ApmContext {
            request_id: ctx.request_id.clone(),
            logger: ctx.logger.clone(),
        };

        match handler(apm_ctx, request).await {
            HandlerOutcome::Completed(response) => {
                self.recorder.record_success(&ctx, response).await
            }
            HandlerOutcome::Failed(failure) => self.fail(&config, ctx, failure).await,
        }
    }

    async fn fail(
        &self,
        config: &Config,
        ctx: CorrelationContext,
        failure: CapturedFailure,
    ) -> Response {
        tracing::error!(
            request_id = %ctx.request_id,
            handler = %ctx.handler,
            error = %failure,
            "Instrumented handler failed"
        );

        self.recorder.record_failure(&ctx).await;

        match self.capture.record(&ctx, &failure).await {
            Ok(trace_id) => self.notify(config, &trace_id).await,
            Err(err) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    error = %err,
                    "Failed to persist error trace, notification skipped"
                );
            }
        }

        let body = serde_json::json!({
            "error": {
                "message": "Internal Server Error",
                "type": "internal_error",
                "request_id": ctx.request_id,
            }
        });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }

    async fn notify(&self, config: &Config, trace_id: &str) {
        if config.server.debug && !config.notify.on_debug {
            tracing::warn!(
                trace_id,
                "Debug mode: error captured but notifications are suppressed"
            );
            return;
        }

        if config.notify.background_queue {
            if let Some(queue) = &self.queue {
                queue.enqueue(trace_id);
                return;
            }
            tracing::warn!(
                trace_id,
                "background_queue is set but no queue was attached, dispatching inline"
            );
        }

        if let Err(err) = self.dispatcher.dispatch(trace_id).await {
            tracing::error!(trace_id, error = %err, "Inline notification dispatch failed");
        }
    }
}
