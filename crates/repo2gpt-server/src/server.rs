//! Router assembly and server lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use repo2gpt_engine::{JobRunner, SubscriptionManager};
use repo2gpt_store::JobStore;
use repo2gpt_telemetry::SqliteLogSink;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::require_api_key;
use crate::config::ServerConfig;
use crate::routes::{admin, events, jobs};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
    pub store: Arc<JobStore>,
    pub subscriptions: Arc<SubscriptionManager>,
    /// Persisted warn+ logs, when enabled.
    pub logs: Option<Arc<SqliteLogSink>>,
    pub api_key: Option<Arc<str>>,
    pub max_upload_bytes: usize,
    /// Cancelled when the server begins shutting down; ends open event streams.
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: &ServerConfig,
        runner: Arc<JobRunner>,
        logs: Option<Arc<SqliteLogSink>>,
    ) -> Self {
        let store = Arc::clone(runner.store());
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&store),
            config.heartbeat_interval,
        ));
        Self {
            runner,
            store,
            subscriptions,
            logs,
            api_key: config.api_key.as_deref().map(Arc::from),
            max_upload_bytes: config.max_upload_bytes,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/jobs",
            post(jobs::create_job)
                .layer(DefaultBodyLimit::max(state.max_upload_bytes))
                .get(jobs::list_jobs),
        )
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/artifacts", get(jobs::get_artifacts))
        .route("/jobs/{id}/history", get(jobs::history))
        .route("/jobs/{id}/events", get(events::stream_events))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/admin/logs", get(admin::logs))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/healthz", get(admin::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve in the background.
pub async fn start(config: &ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let shutdown = state.shutdown.clone();
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "repo2gpt server listening");

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(signal.cancelled_owned());
        if let Err(e) = serve.await {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and close open event streams.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Shut down and wait up to `timeout` for in-flight requests.
    pub async fn shutdown(self, timeout: Duration) {
        self.begin_shutdown();
        if tokio::time::timeout(timeout, self.server).await.is_err() {
            warn!("server shutdown timed out after {timeout:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use repo2gpt_core::tokens::HeuristicTokenizer;
    use repo2gpt_engine::fetch::DefaultFetcher;
    use repo2gpt_engine::summarize::SummarizerRegistry;
    use repo2gpt_engine::RunnerConfig;
    use serde_json::json;
    use tower::ServiceExt;

    fn state(api_key: Option<&str>) -> AppState {
        state_with(ServerConfig {
            api_key: api_key.map(String::from),
            ..ServerConfig::default()
        })
    }

    fn state_with(config: ServerConfig) -> AppState {
        let store = Arc::new(JobStore::in_memory(64).unwrap());
        let runner = Arc::new(JobRunner::new(
            store,
            Arc::new(DefaultFetcher::new(false).unwrap()),
            Arc::new(SummarizerRegistry::with_defaults()),
            Arc::new(HeuristicTokenizer),
            RunnerConfig::default(),
        ));
        AppState::new(&config, runner, None)
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let app = build_router(state(Some("secret")));
        let (status, body) = send(app, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn submit_returns_accepted_pending() {
        let app = build_router(state(None));
        let (status, body) = send(
            app,
            post_json("/jobs", r#"{"source":{"type":"git","url":"https://example.com/r.git"}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");
        assert!(body["id"].as_str().unwrap().starts_with("job"));
    }

    #[tokio::test]
    async fn malformed_submission_is_422() {
        let app = build_router(state(None));
        for bad in [
            r#"{"source":{"type":"ftp","url":"x"}}"#,
            r#"{"source":{"type":"git","url":"x"},"surprise":1}"#,
            r#"{"source":"#,
        ] {
            let (status, body) = send(app.clone(), post_json("/jobs", bad)).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{bad}");
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn oversized_submission_is_413() {
        let app = build_router(state_with(ServerConfig {
            max_upload_bytes: 4096,
            ..ServerConfig::default()
        }));
        let body = json!({
            "source": {"type": "archive_upload", "filename": "r.zip", "content_base64": "A".repeat(8192)}
        });
        let (status, body) = send(app.clone(), post_json("/jobs", &body.to_string())).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body["error"].is_string());

        // Listing is not subject to the submission limit
        let (status, _) = send(app, get("/jobs")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn api_key_guards_job_routes() {
        let app = build_router(state(Some("secret")));
        let (status, _) = send(app.clone(), get("/jobs")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/jobs")
            .header("X-API-Key", "secret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let app = build_router(state(None));
        for uri in ["/jobs/job_nope", "/jobs/job_nope/artifacts", "/jobs/job_nope/history", "/jobs/job_nope/events"] {
            let (status, _) = send(app.clone(), get(uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn artifacts_of_pending_job_conflict() {
        let st = state(None);
        let job = st
            .runner
            .submit(repo2gpt_core::job::JobRequest::new(
                repo2gpt_core::source::SourceSpec::Git {
                    url: "https://example.com/r.git".into(),
                    reference: None,
                },
            ))
            .unwrap();
        let app = build_router(st);
        let (status, _) = send(app, get(&format!("/jobs/{}/artifacts", job.id))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn logs_endpoint_without_sink_is_404() {
        let app = build_router(state(None));
        let (status, _) = send(app, get("/admin/logs")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
