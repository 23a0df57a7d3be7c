//! REST API for the RAG backend
//!
//! Exposes the ingestion, search and conversation surfaces consumed by
//! the router collaborator. Authentication is upstream; the handlers
//! treat `user_id` as an opaque input. Errors map to the structured
//! `{error, message, status_code, details}` body.

use crate::catalog::CollectionCatalog;
use crate::config::Settings;
use crate::conversation::{ConversationMessage, ConversationStore, MessageType};
use crate::cot::CotReasoner;
use crate::embedding::EmbeddingClient;
use crate::error::{RagError, Result};
use crate::ingestion::IngestionPipeline;
use crate::llm::{provider_from_settings, Role};
use crate::llm_params::LlmParametersService;
use crate::prompts::{PromptTemplate, PromptTemplateRepository};
use crate::runtime_config::{
    ConfigCategory, ConfigScope, EffectiveConfig, RuntimeConfigInput, RuntimeConfigRow,
    RuntimeConfigService,
};
use crate::search::{SearchInput, SearchResult, SearchService};
use crate::store::{create_vector_store, VectorStore};
use crate::types::{CollectionRecord, CollectionStatus};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pool: SqlitePool,
    pub store: Arc<dyn VectorStore>,
    pub catalog: CollectionCatalog,
    pub conversation: ConversationStore,
    pub runtime_config: RuntimeConfigService,
    pub prompts: PromptTemplateRepository,
    pub llm_params: LlmParametersService,
    pub ingestion: IngestionPipeline,
    pub search: SearchService,
    pub reasoner: CotReasoner,
}

impl AppState {
    /// Wire up every service from the settings
    pub async fn new(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);
        let pool = SqlitePool::connect(&settings.database.url).await?;

        let store = create_vector_store(&settings.vector_store)?;
        let provider = provider_from_settings(&settings)?;
        let embedder = EmbeddingClient::new(Arc::clone(&provider), settings.embedding.clone());

        let catalog = CollectionCatalog::new(pool.clone());
        catalog.initialize().await?;
        let conversation = ConversationStore::new(pool.clone());
        conversation.initialize().await?;
        let runtime_config = RuntimeConfigService::new(pool.clone(), Arc::clone(&settings));
        runtime_config.initialize().await?;
        let prompts = PromptTemplateRepository::new(pool.clone());
        prompts.initialize().await?;
        let llm_params = LlmParametersService::new(pool.clone());
        llm_params.initialize().await?;

        let ingestion = IngestionPipeline::new(
            Arc::clone(&store),
            embedder.clone(),
            runtime_config.clone(),
            catalog.clone(),
            Arc::clone(&settings),
        );
        let search = SearchService::new(
            Arc::clone(&store),
            embedder,
            provider,
            runtime_config.clone(),
            prompts.clone(),
            llm_params.clone(),
            conversation.clone(),
            catalog.clone(),
            Arc::clone(&settings),
        );
        let reasoner = CotReasoner::new(search.clone(), pool.clone());
        reasoner.initialize().await?;

        Ok(Self {
            settings,
            pool,
            store,
            catalog,
            conversation,
            runtime_config,
            prompts,
            llm_params,
            ingestion,
            search,
            reasoner,
        })
    }
}

impl IntoResponse for RagError {
    fn into_response(self) -> Response {
        let body = self.to_body();
        let status =
            StatusCode::from_u16(body.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

/// Request to create a collection
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateCollectionRequest {
    /// Collection name, unique per deployment
    #[schema(example = "research-papers")]
    pub name: String,
    /// Private collections are visible to the owner only
    #[serde(default)]
    pub is_private: bool,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Owning user
    pub user_id: Uuid,
}

/// Request to queue files for ingestion
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct IngestFilesRequest {
    /// Paths of already-uploaded files
    pub files: Vec<String>,
}

/// Response for queued ingestion
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct IngestQueuedResponse {
    pub collection_id: Uuid,
    #[schema(example = "queued")]
    pub status: String,
    pub files: usize,
}

/// Collection status body
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CollectionStatusResponse {
    pub status: CollectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Suggested questions body
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct SuggestedQuestionsResponse {
    pub questions: Vec<String>,
}

/// Request to open a conversation session
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateSessionRequest {
    pub user_id: Uuid,
    pub collection_id: Uuid,
}

/// Response carrying the new session id
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
}

/// Request to append a conversation message
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct AppendMessageRequest {
    pub content: String,
    pub role: Role,
    #[serde(rename = "type")]
    pub message_type: MessageType,
}

/// A user's resolved pipeline configuration
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct PipelineResponse {
    pub user_id: Uuid,
    pub retrieval: EffectiveConfig,
    pub llm: EffectiveConfig,
    pub cot: EffectiveConfig,
}

/// Component health map
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
}

/// Current-user stub; identity comes from the auth collaborator
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CurrentUserResponse {
    pub user_id: Option<Uuid>,
    pub authenticated: bool,
}

#[derive(OpenApi)]
#[openapi(
    paths(create_collection, collection_status, search_handler, health),
    components(schemas(
        CreateCollectionRequest,
        CollectionStatusResponse,
        SearchInput,
        SearchResult,
        HealthResponse,
    ))
)]
pub struct ApiDoc;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/collections", post(create_collection))
        .route("/api/collections/{id}", delete(delete_collection))
        .route("/api/collections/{id}/files", post(ingest_files))
        .route("/api/collections/{id}/status", get(collection_status))
        .route("/api/collections/{id}/questions", get(collection_questions))
        .route(
            "/api/collections/{id}/reasoning-traces",
            get(reasoning_traces),
        )
        .route("/api/search", post(search_handler))
        .route("/api/conversations", post(create_session))
        .route(
            "/api/conversations/{session_id}/messages",
            post(append_message).get(list_messages),
        )
        .route(
            "/api/runtime-configs",
            post(create_runtime_config).get(list_runtime_configs),
        )
        .route("/api/runtime-configs/{id}", delete(delete_runtime_config))
        .route("/api/prompt-templates", post(save_prompt_template))
        .route("/api/llm-parameters", post(save_llm_parameters))
        .route("/api/users/{id}/pipeline", get(user_pipeline))
        .route("/api/auth/me", get(current_user))
        .route("/api/health", get(health))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on the configured address
pub async fn serve(state: AppState) -> Result<()> {
    let address = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    );
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Listening on {}", address);
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| RagError::Generic(anyhow::anyhow!(e)))?;
    Ok(())
}

#[utoipa::path(
    post,
    path = "/api/collections",
    request_body = CreateCollectionRequest,
    responses((status = 200, description = "Collection registered"))
)]
async fn create_collection(
    State(state): State<AppState>,
    Json(request): Json<CreateCollectionRequest>,
) -> Result<Json<CollectionRecord>> {
    if request.name.trim().is_empty() {
        return Err(RagError::Validation("collection name cannot be empty".to_string()));
    }

    let record = state
        .catalog
        .create(
            &request.name,
            request.user_id,
            request.is_private,
            &state.settings.embedding.model,
            state.settings.embedding.dimension,
        )
        .await?;
    Ok(Json(record))
}

async fn ingest_files(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<IngestFilesRequest>,
) -> Result<Json<IngestQueuedResponse>> {
    if request.files.is_empty() {
        return Err(RagError::Validation("no files supplied".to_string()));
    }
    // The upload transport has already staged the files; queue the work.
    state.catalog.get(id).await?;

    let pipeline = state.ingestion.clone();
    let files: Vec<PathBuf> = request.files.iter().map(PathBuf::from).collect();
    let count = files.len();
    tokio::spawn(async move {
        match pipeline.ingest(id, &files).await {
            Ok(report) => info!(
                "Background ingestion for {} finished: {} ok, {} failed",
                id,
                report.files_succeeded,
                report.files_failed.len()
            ),
            Err(e) => error!("Background ingestion for {} failed: {}", id, e),
        }
    });

    Ok(Json(IngestQueuedResponse {
        collection_id: id,
        status: "queued".to_string(),
        files: count,
    }))
}

#[utoipa::path(
    get,
    path = "/api/collections/{id}/status",
    responses((status = 200, body = CollectionStatusResponse))
)]
async fn collection_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CollectionStatusResponse>> {
    let record = state.catalog.get(id).await?;
    let message = match record.status {
        CollectionStatus::Error => Some("ingestion failed; see the server log".to_string()),
        CollectionStatus::Processing => Some(format!("{} files recorded", record.files.len())),
        _ => None,
    };
    Ok(Json(CollectionStatusResponse {
        status: record.status,
        message,
    }))
}

async fn collection_questions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SuggestedQuestionsResponse>> {
    let record = state.catalog.get(id).await?;
    let questions = state
        .search
        .suggest_questions(id, record.user_id, 5)
        .await?;
    Ok(Json(SuggestedQuestionsResponse { questions }))
}

#[utoipa::path(
    post,
    path = "/api/search",
    request_body = SearchInput,
    responses((status = 200, body = SearchResult))
)]
async fn search_handler(
    State(state): State<AppState>,
    Json(input): Json<SearchInput>,
) -> Result<Json<SearchResult>> {
    // The reasoner decides whether to decompose or pass straight through.
    let result = state.reasoner.reason(&input).await?;
    Ok(Json(result))
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>> {
    state.catalog.get(request.collection_id).await?;
    let session_id = state
        .conversation
        .create_session(request.user_id, request.collection_id)
        .await?;
    Ok(Json(CreateSessionResponse { session_id }))
}

async fn append_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<AppendMessageRequest>,
) -> Result<Json<ConversationMessage>> {
    let token_count = crate::chunking::count_tokens(&request.content) as u32;
    let message_id = state
        .conversation
        .append_message(
            session_id,
            request.role,
            request.message_type,
            &request.content,
            Some(token_count),
            None,
            None,
        )
        .await?;

    let messages = state.conversation.recent_messages(session_id, 1).await?;
    messages
        .into_iter()
        .find(|m| m.id == message_id)
        .map(Json)
        .ok_or_else(|| RagError::NotFound(format!("message {message_id}")))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<ConversationMessage>>> {
    let messages = state.conversation.recent_messages(session_id, 100).await?;
    Ok(Json(messages))
}

async fn user_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PipelineResponse>> {
    let retrieval = state
        .runtime_config
        .effective(ConfigCategory::Retrieval, id, None)
        .await?;
    let llm = state
        .runtime_config
        .effective(ConfigCategory::Llm, id, None)
        .await?;
    let cot = state
        .runtime_config
        .effective(ConfigCategory::Cot, id, None)
        .await?;
    Ok(Json(PipelineResponse {
        user_id: id,
        retrieval,
        llm,
        cot,
    }))
}

async fn delete_collection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let record = state.catalog.get(id).await?;
    // Dropping the store collection cascades to its chunks.
    state.store.delete_collection(&record.name).await?;
    state.catalog.delete(id).await?;
    info!("Deleted collection '{}' ({})", record.name, id);
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// Query string for trace inspection
#[derive(Debug, Deserialize)]
struct TracesQuery {
    user_id: Uuid,
}

async fn reasoning_traces(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TracesQuery>,
) -> Result<Json<Vec<crate::cot::CotOutput>>> {
    state.catalog.get(id).await?;
    let traces = state.reasoner.traces(query.user_id, id).await?;
    Ok(Json(traces))
}

async fn create_runtime_config(
    State(state): State<AppState>,
    Json(input): Json<RuntimeConfigInput>,
) -> Result<Json<RuntimeConfigRow>> {
    let row = state.runtime_config.create(input).await?;
    Ok(Json(row))
}

/// Query string for listing runtime configs
#[derive(Debug, Deserialize)]
struct ListConfigQuery {
    scope: Option<ConfigScope>,
    user_id: Option<Uuid>,
}

async fn list_runtime_configs(
    State(state): State<AppState>,
    Query(query): Query<ListConfigQuery>,
) -> Result<Json<Vec<RuntimeConfigRow>>> {
    let rows = state
        .runtime_config
        .list(query.scope, query.user_id)
        .await?;
    Ok(Json(rows))
}

async fn delete_runtime_config(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    state.runtime_config.delete(id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn save_prompt_template(
    State(state): State<AppState>,
    Json(template): Json<PromptTemplate>,
) -> Result<Json<PromptTemplate>> {
    state.prompts.save(&template).await?;
    Ok(Json(template))
}

async fn save_llm_parameters(
    State(state): State<AppState>,
    Json(parameters): Json<crate::llm_params::LlmParameters>,
) -> Result<Json<crate::llm_params::LlmParameters>> {
    state.llm_params.save(&parameters).await?;
    Ok(Json(parameters))
}

async fn current_user() -> Json<CurrentUserResponse> {
    // Identity is established by the auth middleware collaborator; this
    // core returns an unauthenticated stub when reached directly.
    Json(CurrentUserResponse {
        user_id: None,
        authenticated: false,
    })
}

#[utoipa::path(get, path = "/api/health", responses((status = 200, body = HealthResponse)))]
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut components = HashMap::new();

    let store_status = match state.store.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };
    components.insert(
        format!("vector_store ({})", state.store.backend()),
        store_status,
    );

    let db_status = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };
    components.insert("database".to_string(), db_status);

    let llm = &state.settings.llm;
    let provider_configured = match llm.default_provider.as_str() {
        "watsonx" => llm.watsonx.api_key.is_some(),
        "openai" => llm.openai.api_key.is_some(),
        "anthropic" => llm.anthropic.api_key.is_some(),
        _ => false,
    };
    components.insert(
        format!("llm_provider ({})", llm.default_provider),
        if provider_configured {
            "configured".to_string()
        } else {
            "unconfigured".to_string()
        },
    );

    let status = if components.values().all(|v| v == "ok" || v == "configured") {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        components,
    })
}
