use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use ragkit::agent::AgentType;
use ragkit::completion::{CompletionClient, TokenUsage};
use ragkit::config::{CompletionSettings, IndexSettings};
use ragkit::document::{Document, Metadata, SearchResult};
use ragkit::embedding::Embedder;
use ragkit::error::CoreError;
use ragkit::message::ChatMessage;
use ragkit::service::{AgentService, ChatService, KnowledgeService};
use ragkit::session::SessionSummary;
use ragkit::vector_store::{IndexStats, VectorStore};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ragkit-api",
    about = "HTTP API for retrieval-augmented chat over a vector knowledge base"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "RAGKIT_BIND", default_value = "127.0.0.1:3000")]
    bind: String,

    /// API key for the OpenAI-compatible completion endpoint.
    #[arg(long, env = "GROQ_API_KEY")]
    completion_api_key: String,

    /// Base URL for the completion endpoint.
    #[arg(
        long,
        env = "RAGKIT_COMPLETION_BASE",
        default_value = "https://api.groq.com/openai/v1"
    )]
    completion_base_url: String,

    /// Primary completion model.
    #[arg(long, env = "RAGKIT_MODEL", default_value = "llama-3.3-70b-versatile")]
    model: String,

    /// Fallback model retried once when the primary attempt fails.
    #[arg(
        long,
        env = "RAGKIT_FALLBACK_MODEL",
        default_value = "llama-3.1-8b-instant"
    )]
    fallback_model: String,

    /// Seconds before completion requests time out.
    #[arg(long, env = "RAGKIT_COMPLETION_TIMEOUT_SECS", default_value_t = 60)]
    completion_timeout_secs: u64,

    /// API key for the vector index.
    #[arg(long, env = "PINECONE_API_KEY")]
    index_api_key: String,

    /// Vector index name.
    #[arg(long, env = "RAGKIT_INDEX", default_value = "knowledge-base")]
    index_name: String,

    /// Data-plane host override; skips the control-plane lookup when set.
    #[arg(long, env = "PINECONE_INDEX_HOST")]
    index_host: Option<String>,

    /// Serverless cloud for index creation.
    #[arg(long, env = "RAGKIT_INDEX_CLOUD", default_value = "aws")]
    index_cloud: String,

    /// Serverless region for index creation.
    #[arg(long, env = "RAGKIT_INDEX_REGION", default_value = "us-east-1")]
    index_region: String,

    /// Embedding dimension.
    #[arg(long, env = "RAGKIT_DIMENSION", default_value_t = 1536)]
    dimension: usize,

    /// Fail instead of creating the index when it does not exist.
    #[arg(long)]
    no_create_index: bool,

    /// Seconds before vector index requests time out.
    #[arg(long, env = "RAGKIT_INDEX_TIMEOUT_SECS", default_value_t = 30)]
    index_timeout_secs: u64,
}

#[derive(Clone)]
struct AppState {
    chat: Arc<ChatService>,
    knowledge: Arc<KnowledgeService>,
    agents: Arc<AgentService>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn error_response(err: CoreError) -> ApiError {
    let status = match &err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => {
            tracing::error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = ApiCli::parse();

    let completion_settings = CompletionSettings {
        base_url: cli.completion_base_url,
        api_key: cli.completion_api_key,
        model: cli.model,
        fallback_model: cli.fallback_model,
        timeout: Duration::from_secs(cli.completion_timeout_secs.max(1)),
        ..Default::default()
    };
    let completion = Arc::new(CompletionClient::new(completion_settings)?);

    let index_settings = IndexSettings {
        api_key: cli.index_api_key,
        index_name: cli.index_name,
        host: cli.index_host,
        cloud: cli.index_cloud,
        region: cli.index_region,
        dimension: cli.dimension,
        create_if_missing: !cli.no_create_index,
        timeout: Duration::from_secs(cli.index_timeout_secs.max(1)),
        ..Default::default()
    };
    let store = Arc::new(VectorStore::new(
        Embedder::new(cli.dimension),
        index_settings,
    ));

    let state = AppState {
        chat: Arc::new(ChatService::new(Arc::clone(&completion))),
        knowledge: Arc::new(KnowledgeService::new(Arc::clone(&store))),
        agents: Arc::new(AgentService::new(completion, store)),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/chat/message", post(chat_message))
        .route("/api/chat/stream", post(chat_stream))
        .route(
            "/api/chat/history/:session_id",
            get(chat_history).delete(chat_delete_history),
        )
        .route("/api/chat/sessions", get(chat_sessions))
        .route("/api/knowledge/upload", post(knowledge_upload))
        .route("/api/knowledge/search", post(knowledge_search))
        .route("/api/knowledge/documents", delete(knowledge_delete))
        .route("/api/knowledge/stats", get(knowledge_stats))
        .route("/api/knowledge/clear", delete(knowledge_clear))
        .route("/api/knowledge/batch-upload", post(knowledge_batch_upload))
        .route("/api/agent/query", post(agent_query))
        .route("/api/agent/analyze-intent", post(agent_analyze_intent))
        .route("/api/agent/multi-step", post(agent_multi_step))
        .route("/api/agent/create", post(agent_create))
        .route("/api/agent/history/:agent_id", get(agent_history))
        .route("/api/agent/list", get(agent_list))
        .route("/api/agent/:agent_id", delete(agent_delete))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    tracing::info!(%addr, "ragkit-api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessageRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessageResponse {
    success: bool,
    session_id: String,
    message: String,
    usage: Option<TokenUsage>,
    model: String,
}

async fn chat_message(
    State(state): State<AppState>,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Json<ChatMessageResponse>, ApiError> {
    let reply = state
        .chat
        .send_message(
            request.session_id,
            &request.message,
            request.model,
            request.temperature,
        )
        .await
        .map_err(error_response)?;
    Ok(Json(ChatMessageResponse {
        success: true,
        session_id: reply.session_id,
        message: reply.message,
        usage: reply.usage,
        model: reply.model,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatStreamRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatStreamRequest>,
) -> Result<Sse<UnboundedReceiverStream<Result<Event, Infallible>>>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message is required"));
    }
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let chat = Arc::clone(&state.chat);
    tokio::spawn(async move {
        let chunk_tx = tx.clone();
        let mut forward = move |chunk: &str| {
            let frame = serde_json::json!({ "chunk": chunk });
            let _ = chunk_tx.send(Ok(Event::default().data(frame.to_string())));
        };
        let outcome = chat
            .stream_message(request.session_id, &request.message, &mut forward)
            .await;
        let final_frame = match outcome {
            Ok(reply) => serde_json::json!({ "done": true, "sessionId": reply.session_id }),
            Err(err) => {
                tracing::error!(error = %err, "chat stream failed");
                serde_json::json!({ "error": err.to_string() })
            }
        };
        let _ = tx.send(Ok(Event::default().data(final_frame.to_string())));
    });
    Ok(Sse::new(UnboundedReceiverStream::new(rx)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatHistoryResponse {
    success: bool,
    session_id: String,
    history: Vec<ChatMessage>,
}

async fn chat_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<ChatHistoryResponse> {
    let history = state.chat.history(&session_id).await;
    Json(ChatHistoryResponse {
        success: true,
        session_id,
        history,
    })
}

#[derive(Debug, Serialize)]
struct AckResponse {
    success: bool,
    message: String,
}

async fn chat_delete_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<AckResponse> {
    state.chat.delete_history(&session_id).await;
    Json(AckResponse {
        success: true,
        message: "history deleted".to_string(),
    })
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    success: bool,
    sessions: Vec<SessionSummary>,
}

async fn chat_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        success: true,
        sessions: state.chat.list_sessions().await,
    })
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    documents: Vec<Document>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    success: bool,
    count: usize,
}

async fn knowledge_upload(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    let count = state
        .knowledge
        .upload(&request.documents)
        .await
        .map_err(error_response)?;
    Ok(Json(UploadResponse {
        success: true,
        count,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filter: Option<Metadata>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    success: bool,
    query: String,
    results: Vec<SearchResult>,
    count: usize,
}

async fn knowledge_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let results = state
        .knowledge
        .search(&request.query, request.top_k, request.filter)
        .await
        .map_err(error_response)?;
    Ok(Json(SearchResponse {
        success: true,
        query: request.query,
        count: results.len(),
        results,
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    success: bool,
    deleted_count: usize,
}

async fn knowledge_delete(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted_count = state
        .knowledge
        .delete(&request.ids)
        .await
        .map_err(error_response)?;
    Ok(Json(DeleteResponse {
        success: true,
        deleted_count,
    }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    success: bool,
    stats: IndexStats,
}

async fn knowledge_stats(
    State(state): State<AppState>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.knowledge.stats().await.map_err(error_response)?;
    Ok(Json(StatsResponse {
        success: true,
        stats,
    }))
}

async fn knowledge_clear(State(state): State<AppState>) -> Result<Json<AckResponse>, ApiError> {
    state.knowledge.clear().await.map_err(error_response)?;
    Ok(Json(AckResponse {
        success: true,
        message: "knowledge base cleared".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchUploadRequest {
    text: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    chunk_size: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUploadResponse {
    success: bool,
    chunks: usize,
    total_documents: usize,
    token_estimate: usize,
}

async fn knowledge_batch_upload(
    State(state): State<AppState>,
    Json(request): Json<BatchUploadRequest>,
) -> Result<Json<BatchUploadResponse>, ApiError> {
    let receipt = state
        .knowledge
        .batch_upload(&request.text, request.metadata, request.chunk_size)
        .await
        .map_err(error_response)?;
    Ok(Json(BatchUploadResponse {
        success: true,
        chunks: receipt.chunks,
        total_documents: receipt.documents,
        token_estimate: receipt.token_estimate,
    }))
}

fn parse_agent_type(raw: Option<&str>, fallback: AgentType) -> Result<AgentType, ApiError> {
    match raw {
        Some(value) => value.parse::<AgentType>().map_err(error_response),
        None => Ok(fallback),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentQueryRequest {
    query: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    agent_type: Option<String>,
    #[serde(default = "default_true")]
    use_knowledge_base: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentQueryResponse {
    success: bool,
    agent_id: String,
    answer: String,
    knowledge_used: bool,
    sources: Option<Vec<SearchResult>>,
    usage: Option<TokenUsage>,
}

async fn agent_query(
    State(state): State<AppState>,
    Json(request): Json<AgentQueryRequest>,
) -> Result<Json<AgentQueryResponse>, ApiError> {
    let agent_type = parse_agent_type(request.agent_type.as_deref(), AgentType::Default)?;
    let outcome = state
        .agents
        .query(
            request.agent_id,
            agent_type,
            &request.query,
            request.use_knowledge_base,
        )
        .await
        .map_err(error_response)?;
    Ok(Json(AgentQueryResponse {
        success: true,
        agent_id: outcome.agent_id,
        answer: outcome.reply.answer,
        knowledge_used: outcome.reply.knowledge_used,
        sources: outcome.reply.sources,
        usage: outcome.reply.usage,
    }))
}

#[derive(Debug, Deserialize)]
struct IntentRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct IntentResponse {
    success: bool,
    query: String,
    analysis: ragkit::agent::IntentAnalysis,
}

async fn agent_analyze_intent(
    State(state): State<AppState>,
    Json(request): Json<IntentRequest>,
) -> Result<Json<IntentResponse>, ApiError> {
    let analysis = state
        .agents
        .analyze(&request.query)
        .await
        .map_err(error_response)?;
    Ok(Json(IntentResponse {
        success: true,
        query: request.query,
        analysis,
    }))
}

#[derive(Debug, Deserialize)]
struct StepSpec {
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiStepRequest {
    task: String,
    steps: Vec<StepSpec>,
    #[serde(default)]
    agent_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MultiStepResponse {
    success: bool,
    task: String,
    steps: Vec<ragkit::agent::StepResult>,
    final_answer: String,
}

async fn agent_multi_step(
    State(state): State<AppState>,
    Json(request): Json<MultiStepRequest>,
) -> Result<Json<MultiStepResponse>, ApiError> {
    let agent_type = parse_agent_type(request.agent_type.as_deref(), AgentType::Analytical)?;
    let descriptions: Vec<String> = request
        .steps
        .iter()
        .map(|step| step.description.clone())
        .collect();
    let reasoning = state
        .agents
        .multi_step(agent_type, &request.task, &descriptions)
        .await
        .map_err(error_response)?;
    Ok(Json(MultiStepResponse {
        success: true,
        task: request.task,
        steps: reasoning.steps,
        final_answer: reasoning.final_answer,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAgentRequest {
    #[serde(default)]
    agent_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAgentResponse {
    success: bool,
    agent_id: String,
    agent_type: AgentType,
}

async fn agent_create(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> Result<Json<CreateAgentResponse>, ApiError> {
    let agent_type = parse_agent_type(request.agent_type.as_deref(), AgentType::Default)?;
    let agent_id = state.agents.create(agent_type).await;
    Ok(Json(CreateAgentResponse {
        success: true,
        agent_id,
        agent_type,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentHistoryResponse {
    success: bool,
    agent_id: String,
    history: Vec<ChatMessage>,
}

async fn agent_history(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentHistoryResponse>, ApiError> {
    let history = state
        .agents
        .history(&agent_id)
        .await
        .map_err(error_response)?;
    Ok(Json(AgentHistoryResponse {
        success: true,
        agent_id,
        history,
    }))
}

#[derive(Debug, Serialize)]
struct AgentListResponse {
    success: bool,
    agents: Vec<ragkit::agent::AgentSummary>,
}

async fn agent_list(State(state): State<AppState>) -> Json<AgentListResponse> {
    Json(AgentListResponse {
        success: true,
        agents: state.agents.list().await,
    })
}

#[derive(Debug, Deserialize)]
struct AgentActionQuery {
    #[serde(default)]
    action: Option<String>,
}

async fn agent_delete(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<AgentActionQuery>,
) -> Result<Json<AckResponse>, ApiError> {
    let message = match query.action.as_deref().unwrap_or("reset") {
        "reset" => {
            state
                .agents
                .reset(&agent_id)
                .await
                .map_err(error_response)?;
            "agent history has been reset"
        }
        "delete" => {
            state
                .agents
                .delete(&agent_id)
                .await
                .map_err(error_response)?;
            "agent has been deleted"
        }
        other => {
            return Err(bad_request(format!("invalid action: {other}")));
        }
    };
    Ok(Json(AckResponse {
        success: true,
        message: message.to_string(),
    }))
}
