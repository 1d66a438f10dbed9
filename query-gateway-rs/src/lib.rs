//! Query orchestration gateway.
//!
//! Accepts chat queries, routes each one to the domain services whose
//! capability tags it implies, calls them concurrently and merges their
//! answers into one result. Progress can be followed as server-sent events.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::rejection::{BytesRejection, QueryRejection},
    extract::{DefaultBodyLimit, FromRequest, Path, Query, State},
    http::{Method, Request, StatusCode},
    middleware::{self, Next},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use config_rs::GatewayConfig;
use futures_util::stream::{self, Stream};
use once_cell::sync::Lazy;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod dispatcher;
pub mod domain_client;
pub mod error;
pub mod health;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod router;
pub mod session;
pub mod synthesizer;
pub mod validation;

use dispatcher::Dispatcher;
use domain_client::{DomainClient, HttpDomainClient};
use error::GatewayError;
use health::{HealthProber, HealthTable};
use models::{
    ChatRequest, ChatResponse, HealthResponse, HealthState, NewConversationResponse, ProgressEvent,
    RegistryReloadResponse, ServiceCatalogEntry,
};
use pipeline::QueryPipeline;
use registry::{descriptors_from_config, ServiceRegistry};
use router::{KeywordTagExtractor, QueryRouter};
use session::ConversationStore;
use synthesizer::Synthesizer;
use validation::{parse_chat_request, validate_content_type, validate_user_id, ApiValidationError};

pub use error::ErrorResponse;

pub const SERVICE_NAME: &str = "query-gateway";

pub static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub conversation_id: String,
}

/// Gateway state shared by every handler
pub struct QueryGateway {
    config: GatewayConfig,
    config_path: Option<PathBuf>,
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthTable>,
    prober: Arc<HealthProber>,
    pipeline: Arc<QueryPipeline>,
}

impl QueryGateway {
    /// Builds the registry, health table and query pipeline. Fails on a
    /// duplicate or malformed service entry.
    pub fn new(config: GatewayConfig, client: Arc<dyn DomainClient>) -> Result<Self, GatewayError> {
        let registry = Arc::new(ServiceRegistry::from_config(&config)?);
        let health = Arc::new(HealthTable::new(
            registry.snapshot().names(),
            config.health.failure_threshold,
        ));

        let prober = Arc::new(HealthProber::new(
            registry.clone(),
            health.clone(),
            client.clone(),
            config.health.clone(),
        ));

        let router = QueryRouter::new(
            Arc::new(
                KeywordTagExtractor::new(config.router.keywords.clone())
                    .with_gene_symbols(&config.router.gene_symbols),
            ),
            config.dispatch.degraded_timeout_factor,
        );
        let dispatcher = Dispatcher::with_settings(
            client,
            Duration::from_millis(config.dispatch.retry_backoff_ms),
            Duration::from_millis(config.dispatch.batch_margin_ms),
        );
        let conversations = ConversationStore::new(
            config.conversation.max_history,
            config.conversation.context_turns,
        );

        let pipeline = Arc::new(QueryPipeline::new(
            registry.clone(),
            health.clone(),
            router,
            dispatcher,
            Synthesizer::default(),
            conversations,
        ));

        info!(services = registry.snapshot().len(), "Query gateway initialized");

        Ok(Self {
            config,
            config_path: None,
            registry,
            health,
            prober,
            pipeline,
        })
    }

    /// Gateway talking HTTP to the configured services
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = HttpDomainClient::new()
            .map_err(|e| GatewayError::Internal(format!("HTTP client: {}", e)))?;
        Self::new(config, Arc::new(client))
    }

    /// File re-read by `POST /registry/reload`
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn health_table(&self) -> &Arc<HealthTable> {
        &self.health
    }

    pub fn prober(&self) -> &Arc<HealthProber> {
        &self.prober
    }

    pub fn pipeline(&self) -> &Arc<QueryPipeline> {
        &self.pipeline
    }

    pub async fn wait_until_ready(&self) -> Result<usize, GatewayError> {
        self.prober.wait_until_ready().await
    }

    pub fn start_health_prober(&self) -> JoinHandle<()> {
        self.prober.clone().spawn()
    }

    /// Re-reads the configuration file and swaps the registry. Health of
    /// kept services survives; new ones start `unknown`.
    pub async fn reload_registry(&self) -> Result<RegistryReloadResponse, GatewayError> {
        let path = self.config_path.clone().unwrap_or_else(GatewayConfig::config_path);
        let config = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || GatewayConfig::load_from_path(&path))
                .await
                .map_err(|e| GatewayError::Internal(format!("configuration reload task failed: {}", e)))??
        };
        let descriptors = descriptors_from_config(&config)?;

        let before = self.registry.snapshot().names();
        let snapshot = self.registry.reload(descriptors)?;
        let after = snapshot.names();
        self.health.sync(&after);

        let added: Vec<String> = after.iter().filter(|n| !before.contains(n)).cloned().collect();
        let removed: Vec<String> = before.iter().filter(|n| !after.contains(n)).cloned().collect();
        info!(path = %path.display(), ?added, ?removed, "Registry reloaded from configuration");

        Ok(RegistryReloadResponse { services: after, added, removed })
    }

    /// Create the Axum router with all routes and middleware
    pub fn create_router(self: Arc<Self>) -> Router {
        Lazy::force(&START_TIME);
        let body_limit = self.config.server.body_limit_bytes;

        Router::new()
            .route("/", get(Self::root_handler))
            .route("/health", get(Self::health_handler))
            .route("/services", get(Self::services_handler))
            .route("/registry/reload", post(Self::reload_handler))
            .route("/chat/:user_id", post(Self::chat_handler))
            .route("/chat/:user_id/stream", post(Self::stream_handler))
            .route("/chat/:user_id/history", get(Self::history_handler))
            .route("/chat/:user_id/new-conversation", post(Self::new_conversation_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
                    .layer(DefaultBodyLimit::max(body_limit))
                    .layer(middleware::from_fn(Self::validate_content_type_middleware)),
            )
            .with_state(self)
    }

    async fn root_handler() -> impl IntoResponse {
        Json(serde_json::json!({
            "service": "Query Orchestration Gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "endpoints": [
                "GET /health",
                "GET /services",
                "POST /registry/reload",
                "POST /chat/{user_id}",
                "POST /chat/{user_id}/stream",
                "GET /chat/{user_id}/history?conversation_id=",
                "POST /chat/{user_id}/new-conversation"
            ]
        }))
    }

    async fn health_handler(State(state): State<Arc<Self>>) -> impl IntoResponse {
        let services: Vec<_> = state
            .registry
            .snapshot()
            .all()
            .iter()
            .map(|d| state.health.current_status(&d.name))
            .collect();

        let total_services = services.len();
        let healthy_services = services
            .iter()
            .filter(|s| s.state == HealthState::Healthy)
            .count();
        let reachable = services
            .iter()
            .filter(|s| matches!(s.state, HealthState::Healthy | HealthState::Degraded))
            .count();

        let status = if total_services > 0 && healthy_services == total_services {
            "SERVING"
        } else if reachable > 0 {
            "DEGRADED"
        } else {
            "CRITICAL"
        };

        Json(HealthResponse {
            healthy: reachable > 0,
            service_name: SERVICE_NAME.to_string(),
            uptime_seconds: START_TIME.elapsed().as_secs(),
            status: status.to_string(),
            healthy_services,
            total_services,
            services,
        })
    }

    async fn services_handler(State(state): State<Arc<Self>>) -> impl IntoResponse {
        let catalog: Vec<ServiceCatalogEntry> = state
            .registry
            .snapshot()
            .all()
            .iter()
            .map(|d| ServiceCatalogEntry {
                descriptor: d.as_ref().clone(),
                health: state.health.current_status(&d.name),
            })
            .collect();
        Json(catalog)
    }

    async fn reload_handler(
        State(state): State<Arc<Self>>,
    ) -> Result<Json<RegistryReloadResponse>, GatewayError> {
        state.reload_registry().await.map(Json)
    }

    async fn chat_handler(
        State(state): State<Arc<Self>>,
        Path(user_id): Path<String>,
        ChatBody(request): ChatBody,
    ) -> Result<Json<ChatResponse>, GatewayError> {
        let prepared = state.pipeline.prepare(&user_id, request).await?;
        info!(query_id = %prepared.query_id, user_id = %user_id, "Chat request");

        // spawned so a dropped connection does not cancel the query
        let pipeline = state.pipeline.clone();
        let response = tokio::spawn(async move { pipeline.execute(prepared, None).await })
            .await
            .map_err(|e| GatewayError::Internal(format!("query task failed: {}", e)))??;

        Ok(Json(response))
    }

    async fn stream_handler(
        State(state): State<Arc<Self>>,
        Path(user_id): Path<String>,
        ChatBody(request): ChatBody,
    ) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
        let prepared = state.pipeline.prepare(&user_id, request).await?;
        info!(query_id = %prepared.query_id, user_id = %user_id, "Streaming chat request");

        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = state.pipeline.clone();
        tokio::spawn(async move {
            // the outcome reaches the caller through the event stream
            let _ = pipeline.execute(prepared, Some(tx)).await;
        });

        let keepalive = Duration::from_secs(state.config.server.sse_keepalive_secs.max(1));
        Ok(Sse::new(progress_stream(rx)).keep_alive(KeepAlive::new().interval(keepalive)))
    }

    async fn history_handler(
        State(state): State<Arc<Self>>,
        Path(user_id): Path<String>,
        params: Result<Query<HistoryParams>, QueryRejection>,
    ) -> Result<impl IntoResponse, GatewayError> {
        validate_user_id(&user_id)?;
        let Query(params) =
            params.map_err(|rejection| ApiValidationError::InvalidFormat(rejection.body_text()))?;
        let history = state
            .pipeline
            .conversations()
            .history(&params.conversation_id, &user_id)
            .await?;
        Ok(Json(history))
    }

    async fn new_conversation_handler(
        State(state): State<Arc<Self>>,
        Path(user_id): Path<String>,
    ) -> Result<impl IntoResponse, GatewayError> {
        validate_user_id(&user_id)?;
        let conversation_id = state.pipeline.conversations().create(&user_id).await;
        Ok((
            StatusCode::CREATED,
            Json(NewConversationResponse { conversation_id, user_id }),
        ))
    }

    /// Chat bodies must be JSON
    async fn validate_content_type_middleware(req: Request<Body>, next: Next) -> Response {
        let path = req.uri().path();
        let needs_json = req.method() == Method::POST
            && path.starts_with("/chat/")
            && !path.ends_with("/new-conversation");

        if needs_json {
            if let Err(err) = validate_content_type(req.headers(), "application/json") {
                return err.to_response().into_response();
            }
        }

        next.run(req).await
    }
}

/// A validated chat body. Buffering failures, including an exceeded body
/// limit, are reported with the structured error body.
pub struct ChatBody(pub ChatRequest);

#[async_trait]
impl FromRequest<Arc<QueryGateway>> for ChatBody {
    type Rejection = GatewayError;

    async fn from_request(req: Request<Body>, state: &Arc<QueryGateway>) -> Result<Self, Self::Rejection> {
        let limit = state.config.server.body_limit_bytes;
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| body_rejection(rejection, limit))?;
        Ok(Self(parse_chat_request(&body, limit)?))
    }
}

fn body_rejection(rejection: BytesRejection, limit: usize) -> ApiValidationError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiValidationError::PayloadTooLarge(format!("request body exceeds {} bytes", limit))
    } else {
        ApiValidationError::InvalidFormat(rejection.body_text())
    }
}

/// SSE frames from a query's progress events; ends when the query does
fn progress_stream(
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(receiver, |mut rx| async move {
        let event = rx.recv().await?;
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(e) => {
                error!(query_id = %event.query_id, error = %e, "Failed to encode progress event");
                String::from("{}")
            }
        };

        let frame = Event::default()
            .event(event.status.as_str())
            .id(event.sequence_number.to_string())
            .data(data);
        Some((Ok::<_, Infallible>(frame), rx))
    })
}
