use anyhow::Result;
use arc_swap::ArcSwap;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api,
    config::Config,
    instrument::Apm,
    metrics,
    notify::{Dispatcher, NotifierRegistry, NotifyQueue},
    store::ApmStore,
};

/// Start the tracevault server
///
/// This function:
/// 1. Initializes metrics
/// 2. Connects the store and runs migrations
/// 3. Builds the notifier registry and, when configured, the background queue
/// 4. Creates the Axum application (demo polls service + operator API)
/// 5. Serves requests with graceful shutdown, draining the queue on exit
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize metrics
    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics());

    info!(database_url = %config.storage.database_url, "Connecting APM store");
    let store = ApmStore::connect(&config.storage.database_url).await?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let registry = NotifierRegistry::builtin(http_client);
    info!("Notifier platforms: {}", registry.platforms().join(", "));

    let dispatcher = Arc::new(Dispatcher::new(store.clone(), registry, &config.notify));

    let (queue, queue_handle) = if config.notify.background_queue {
        let (queue, handle) = NotifyQueue::spawn(dispatcher.clone(), &config.notify);
        (Some(queue), Some(handle))
    } else {
        (None, None)
    };

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    // Shared config with atomic swap for lock-free reads
    let config_swap = Arc::new(ArcSwap::from_pointee(config));

    let apm = Apm::new(config_swap, store, dispatcher, queue);

    let app = create_router(apm.clone(), metrics_handle);

    info!("Starting tracevault on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The adapter closures inside the router died with the serve future.
    // Dropping the last handle closes the queue so the worker drains and exits.
    drop(apm);
    if let Some(handle) = queue_handle {
        info!("Draining notification queue...");
        handle.await?;
    }

    info!("Server stopped");
    Ok(())
}

/// Create the Axum router with all routes
fn create_router(apm: Apm, metrics_handle: Arc<PrometheusHandle>) -> Router {
    // Operator API under /apm, bearer-guarded; permissive CORS so external
    // dashboards can query the datasets
    let operator_routes = api::router(apm.clone()).layer(CorsLayer::permissive());

    // Public endpoints (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .with_state(metrics_handle);

    demo_router(&apm)
        .nest("/apm", operator_routes)
        .merge(public_routes)
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
}

/// Demonstration polls service with the pipeline installed end to end
///
/// `GET /api/polls` answers JSON through a mediated adapter. `GET|POST
/// /api/polls/fail` logs at several levels and fails on POST, exercising
/// capture and notification. `/polls` shows a direct-wrapped page handler,
/// `/api/polls/latest` an endpoint-style one.
fn demo_router(apm: &Apm) -> Router {
    Router::new()
        .route("/polls", get(apm.direct(demo::polls_page)))
        .route("/api/polls", get(apm.api(demo::list_polls)))
        .route("/api/polls/latest", get(apm.api_endpoint(demo::LatestPoll)))
        .route(
            "/api/polls/fail",
            get(apm.api(demo::flaky_poll)).post(apm.api(demo::flaky_poll)),
        )
}

/// Handle /health endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Handle /metrics endpoint
async fn metrics_endpoint(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}

/// Resolves when SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

mod demo {
    use axum::{
        extract::Request,
        http::Method,
        response::{Html, IntoResponse, Response},
        Json,
    };
    use serde_json::json;

    use crate::instrument::{ApmContext, ApmEndpoint};
    use crate::outcome::{CapturedFailure, HandlerOutcome};

    #[derive(Debug, thiserror::Error)]
    #[error("poll {0} has a negative vote count")]
    struct PollStateError(u32);

    pub(super) async fn polls_page(ctx: ApmContext, _request: Request) -> HandlerOutcome {
        ctx.logger.info("rendering the polls index page");
        Html("<h1>Polls</h1><p>The API lives under /api/polls.</p>")
            .into_response()
            .into()
    }

    pub(super) async fn list_polls(ctx: ApmContext, _request: Request) -> HandlerOutcome {
        ctx.logger.info("listing open polls");
        Json(json!({
            "polls": [
                { "id": 1, "question": "What is your favorite language?", "votes": 42 },
                { "id": 2, "question": "Tabs or spaces?", "votes": 17 },
            ]
        }))
        .into_response()
        .into()
    }

    /// Logs at several levels, then fails on POST. The captured logs show up
    /// in the notification message for the recorded trace.
    pub(super) async fn flaky_poll(ctx: ApmContext, request: Request) -> HandlerOutcome {
        ctx.logger.debug("entering the flaky poll endpoint");
        ctx.logger.info("loading poll 1");
        ctx.logger.warning("vote counts for poll 1 look inconsistent");

        match vote_response(&ctx, request.method()) {
            Ok(response) => HandlerOutcome::Completed(response),
            Err(failure) => HandlerOutcome::Failed(failure),
        }
    }

    fn vote_response(ctx: &ApmContext, method: &Method) -> Result<Response, CapturedFailure> {
        if method == Method::POST {
            ctx.logger.error("giving up on the vote submission");
            submit_vote()?;
        }
        Ok(Json(json!({
            "id": 1,
            "question": "What is your favorite language?",
            "votes": 42,
        }))
        .into_response())
    }

    fn submit_vote() -> Result<(), PollStateError> {
        Err(PollStateError(1))
    }

    /// Class-style handler wrapped by `api_endpoint`
    pub(super) struct LatestPoll;

    #[async_trait::async_trait]
    impl ApmEndpoint for LatestPoll {
        async fn handle(&self, ctx: ApmContext, _request: Request) -> HandlerOutcome {
            ctx.logger.info("serving the most recent poll");
            Json(json!({ "id": 2, "question": "Tabs or spaces?" }))
                .into_response()
                .into()
        }
    }
}
