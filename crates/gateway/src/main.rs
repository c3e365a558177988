//! InvoiceQA API Gateway
//!
//! The HTTP entry point for asking questions about invoices.
//! Handles:
//! - Question answering and conversation sessions
//! - Rate limiting
//! - Request routing
//! - Observability (logging, metrics, tracing)

mod handlers;
mod middleware;

use axum::{
    routing::{delete, get, post},
    Router,
};
use invoiceqa_common::{
    config::AppConfig,
    db::{DbPool, Repository},
    embeddings::create_embedder,
    engine::{AnswerSynthesizer, ChatCompletionGenerator, QueryEngine, SemanticIndex},
    errors::{AppError, Result},
    index::{documents_for_invoice, InMemoryIndex, IndexWriter, PgVectorIndex},
    metrics,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::middleware::rate_limit::RateLimitState;

/// Invoices loaded into the in-memory index at startup
const MEMORY_INDEX_SEED_LIMIT: u64 = 10_000;

/// Interval between idle session sweeps
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<QueryEngine>,
    pub repository: Repository,
    pub indexer: Arc<dyn IndexWriter>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("APP_CONFIG_FILE") {
        Ok(path) => AppConfig::from_file(&path)?,
        Err(_) => AppConfig::load()?,
    };
    let config = Arc::new(config);

    init_tracing(&config);
    info!("Starting InvoiceQA API Gateway v{}", invoiceqa_common::VERSION);

    // Initialize metrics
    init_metrics(&config)?;

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    let repository = Repository::new(db.clone());

    let (index, indexer) = build_index(&config, db, &repository).await?;

    let mut synthesizer = AnswerSynthesizer::new(config.engine.max_answer_items)?;
    match ChatCompletionGenerator::from_config(&config.llm)? {
        Some(generator) => {
            info!(model = %config.llm.model, "Answer generation backend enabled");
            synthesizer = synthesizer.with_generator(Arc::new(generator));
        }
        None => info!("No generation backend configured, answers are extractive"),
    }

    let engine = Arc::new(QueryEngine::new(
        config.engine.clone(),
        Arc::new(repository.clone()),
        index,
        synthesizer,
    ));

    spawn_session_sweeper(engine.clone());

    // Create app state
    let state = AppState {
        config: config.clone(),
        engine,
        repository,
        indexer,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| AppError::Configuration {
            message: format!("invalid server address: {}", e),
        })?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.shutdown_timeout()))
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    if config.observability.json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

fn init_metrics(config: &AppConfig) -> Result<()> {
    let port = config.observability.metrics_port;
    if port == 0 {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .set_buckets(metrics::LATENCY_BUCKETS)
        .and_then(|builder| builder.install())
        .map_err(|e| AppError::Configuration {
            message: format!("failed to install metrics exporter: {}", e),
        })?;

    metrics::register_metrics();
    info!(port, "Metrics exporter listening");
    Ok(())
}

/// Pick the semantic index backend named in `engine.index_backend`
async fn build_index(
    config: &AppConfig,
    db: DbPool,
    repository: &Repository,
) -> Result<(Arc<dyn SemanticIndex>, Arc<dyn IndexWriter>)> {
    let embedder = create_embedder(&config.embedding)?;
    info!(
        provider = %config.embedding.provider,
        model = embedder.model_name(),
        dimension = embedder.dimension(),
        "Embedder ready"
    );

    match config.engine.index_backend.as_str() {
        "pgvector" => {
            let index = Arc::new(PgVectorIndex::new(db, embedder));
            Ok((index.clone(), index))
        }
        "memory" => {
            let index = Arc::new(InMemoryIndex::new(embedder));
            let invoices = repository
                .list_invoices_with_line_items(MEMORY_INDEX_SEED_LIMIT)
                .await?;
            let documents = invoices
                .iter()
                .flat_map(|(invoice, items)| documents_for_invoice(invoice, items))
                .collect::<Vec<_>>();
            let count = index.index_documents(documents).await?;
            info!(invoices = invoices.len(), documents = count, "In-memory index seeded");
            Ok((index.clone(), index))
        }
        other => Err(AppError::Configuration {
            message: format!("Unknown index backend: {}", other),
        }),
    }
}

/// Periodically drop sessions idle for longer than the configured TTL
fn spawn_session_sweeper(engine: Arc<QueryEngine>) {
    let ttl = engine.config().session_ttl();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = engine.sessions().evict_idle(ttl).await;
            if evicted > 0 {
                info!(evicted, "Evicted idle sessions");
            }
        }
    });
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let mut api_routes = Router::new()
        .route("/ask", post(handlers::ask::ask))
        .route("/sessions/{session_id}/history", get(handlers::sessions::get_history))
        .route("/sessions/{session_id}", delete(handlers::sessions::end_session))
        .route(
            "/invoices/{order_id}/reindex",
            post(handlers::invoices::reindex_invoice),
        );

    let rate_limit = &state.config.rate_limit;
    if rate_limit.enabled {
        let limiter = RateLimitState::new(rate_limit.requests_per_second, rate_limit.burst);
        api_routes = api_routes.layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit::rate_limit_middleware,
        ));
    }

    let timeout = TimeoutLayer::new(state.config.request_timeout());

    // Compose the app
    Router::new()
        // Health endpoints (not rate limited)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(axum::middleware::from_fn(middleware::metrics::track_requests))
        .layer(timeout)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal(grace: Duration) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }

    // In-flight requests get `grace` to finish
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!(grace_secs = grace.as_secs(), "Graceful shutdown timed out, exiting");
        std::process::exit(1);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use crate::handlers::ask::AskResponse;
    use crate::handlers::sessions::HistoryResponse;
    use invoiceqa_common::embeddings::HashEmbedder;
    use invoiceqa_common::engine::{
        Fields, StructuredConstraints, StructuredRow, StructuredStore, NO_MATCH_ANSWER,
    };
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct OrderStore;

    #[async_trait]
    impl StructuredStore for OrderStore {
        async fn lookup(&self, constraints: &StructuredConstraints) -> Result<Vec<StructuredRow>> {
            constraints.validate()?;
            if constraints.order_id.as_deref() != Some("10250") {
                return Ok(vec![]);
            }
            let mut fields = Fields::new();
            fields.insert("order_id".into(), json!("10250"));
            fields.insert("contact_name".into(), json!("Mario Pontes"));
            fields.insert("total_price".into(), json!(1552.6));
            Ok(vec![StructuredRow::new("10250", fields)])
        }
    }

    fn test_state(mock: MockDatabase, rate_limit: bool) -> AppState {
        let mut config = AppConfig::default();
        config.rate_limit.enabled = rate_limit;
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst = 1;

        let pool = DbPool::from_connections(mock.into_connection(), None);
        let index = Arc::new(InMemoryIndex::new(Arc::new(HashEmbedder::new(64))));
        let synthesizer = AnswerSynthesizer::new(config.engine.max_answer_items).unwrap();
        let engine = QueryEngine::new(
            config.engine.clone(),
            Arc::new(OrderStore),
            index.clone(),
            synthesizer,
        );

        AppState {
            config: Arc::new(config),
            engine: Arc::new(engine),
            repository: Repository::new(pool),
            indexer: index,
        }
    }

    fn app() -> Router {
        create_router(test_state(MockDatabase::new(DatabaseBackend::Postgres), false))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn ask(body: Value) -> Request<Body> {
        Request::post("/v1/ask")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ready_reflects_database() {
        let up = MockDatabase::new(DatabaseBackend::Postgres).append_exec_results([MockExecResult {
            last_insert_id: 0,
            rows_affected: 1,
        }]);
        let (status, body) = send(
            &create_router(test_state(up, false)),
            Request::get("/ready").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["database"]["status"], "up");

        // No queued result: the mock ping fails
        let (status, body) = send(&app(), Request::get("/ready").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");
    }

    #[tokio::test]
    async fn test_ask_then_history_then_end() {
        let app = app();

        let (status, body) = send(
            &app,
            ask(json!({"question": "What is the total for order 10250?", "session_id": "chat-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let answer: AskResponse = serde_json::from_value(body).unwrap();
        assert_eq!(answer.session_id, "chat-1");
        assert_eq!(answer.citations, vec!["10250"]);
        assert!(answer.answer.contains("1552.6"));

        let (status, body) = send(
            &app,
            Request::get("/v1/sessions/chat-1/history").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let history: HistoryResponse = serde_json::from_value(body).unwrap();
        assert_eq!(history.turns.len(), 1);
        assert_eq!(history.turns[0].evidence_ids, vec!["10250"]);

        let (status, _) = send(
            &app,
            Request::delete("/v1/sessions/chat-1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            &app,
            Request::get("/v1/sessions/chat-1/history").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_ask_without_session_starts_one() {
        let (status, body) = send(&app(), ask(json!({"question": "Show order 99999"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answer"], NO_MATCH_ANSWER);
        assert_eq!(body["session_id"].as_str().unwrap().len(), 36);
    }

    #[tokio::test]
    async fn test_ask_validation() {
        let app = app();

        let (status, _) = send(&app, ask(json!({"question": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let long = "a".repeat(2001);
        let (status, _) = send(&app, ask(json!({"question": long}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            ask(json!({"question": "order 10250", "session_id": "not valid!"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("session"));
    }

    #[tokio::test]
    async fn test_rate_limit_applies_to_api_only() {
        let app = create_router(test_state(MockDatabase::new(DatabaseBackend::Postgres), true));

        let (status, _) = send(&app, ask(json!({"question": "order 10250"}))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, ask(json!({"question": "order 10250"}))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, _) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_reindex_rejects_non_numeric_order() {
        let (status, _) = send(
            &app(),
            Request::post("/v1/invoices/abc/reindex").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
