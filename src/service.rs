//! Application services tying sessions, agents, and the knowledge base to
//! the completion client. Input validation happens here, before any
//! network-touching call.

use std::sync::Arc;

use serde::Serialize;

use crate::agent::{
    analyze_intent, Agent, AgentRegistry, AgentReply, AgentSummary, AgentType, IntentAnalysis,
    Reasoning,
};
use crate::chunker::split_into_chunks;
use crate::completion::{CompletionClient, CompletionOptions, TokenUsage};
use crate::document::{Document, Metadata, SearchResult};
use crate::error::{CoreError, CoreResult};
use crate::message::{estimate_tokens, ChatMessage, Role};
use crate::session::{SessionStore, SessionSummary};
use crate::vector_store::{IndexStats, VectorStore};

/// Default hit count for knowledge searches.
pub const DEFAULT_SEARCH_TOP_K: usize = 5;

/// Default chunk budget for batched text ingestion, in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Finished non-streaming chat turn.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    /// Session the turn was recorded under.
    pub session_id: String,
    /// Assistant reply text.
    pub message: String,
    /// Usage reported by the completion endpoint.
    pub usage: Option<TokenUsage>,
    /// Model that produced the reply.
    pub model: String,
}

/// Finished streaming chat turn; the text was already delivered chunkwise.
#[derive(Debug, Clone, Serialize)]
pub struct StreamReply {
    /// Session the turn was recorded under.
    pub session_id: String,
    /// Full accumulated assistant text.
    pub message: String,
}

/// Chat over bounded sessions.
pub struct ChatService {
    sessions: SessionStore,
    completion: Arc<CompletionClient>,
}

impl ChatService {
    /// Builds the service over a completion client.
    pub fn new(completion: Arc<CompletionClient>) -> Self {
        Self {
            sessions: SessionStore::new(),
            completion,
        }
    }

    /// Records the user turn, completes over the session history, and
    /// records the assistant turn. A missing session id starts a new
    /// session. The user turn stays recorded even when completion fails.
    pub async fn send_message(
        &self,
        session_id: Option<String>,
        message: &str,
        model: Option<String>,
        temperature: Option<f32>,
    ) -> CoreResult<ChatReply> {
        if message.trim().is_empty() {
            return Err(CoreError::Validation("message is required".to_string()));
        }
        let session_id = session_id.unwrap_or_else(|| self.sessions.next_session_id());
        self.sessions.append(&session_id, Role::User, message).await;

        let history = self.sessions.history(&session_id).await;
        let options = CompletionOptions {
            model,
            temperature,
            ..Default::default()
        };
        let completion = self.completion.complete(&history, &options).await?;
        self.sessions
            .append(&session_id, Role::Assistant, &completion.content)
            .await;

        Ok(ChatReply {
            session_id,
            message: completion.content,
            usage: completion.usage,
            model: completion.model_used,
        })
    }

    /// Streams a reply over the session history, forwarding each fragment to
    /// `on_chunk`. Both turns are recorded only after the stream finishes;
    /// a stream error leaves the session exactly as it was.
    pub async fn stream_message(
        &self,
        session_id: Option<String>,
        message: &str,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> CoreResult<StreamReply> {
        if message.trim().is_empty() {
            return Err(CoreError::Validation("message is required".to_string()));
        }
        let session_id = session_id.unwrap_or_else(|| self.sessions.next_session_id());

        let mut history = self.sessions.history(&session_id).await;
        history.push(ChatMessage::now(Role::User, message));

        let mut accumulated = String::new();
        let mut tap = |fragment: &str| {
            accumulated.push_str(fragment);
            on_chunk(fragment);
        };
        self.completion.stream_complete(&history, &mut tap).await?;

        self.sessions.append(&session_id, Role::User, message).await;
        self.sessions
            .append(&session_id, Role::Assistant, &accumulated)
            .await;

        Ok(StreamReply {
            session_id,
            message: accumulated,
        })
    }

    /// Retained history for the session; empty when unknown.
    pub async fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.sessions.history(session_id).await
    }

    /// Destroys the session. Deleting an unknown session is not an error.
    pub async fn delete_history(&self, session_id: &str) {
        self.sessions.clear(session_id).await;
    }

    /// One summary per live session.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.list().await
    }
}

/// Receipt for a batched text ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReceipt {
    /// Number of chunks the text was split into.
    pub chunks: usize,
    /// Number of documents written to the index.
    pub documents: usize,
    /// Rough token total across all chunks.
    pub token_estimate: usize,
}

/// Knowledge-base ingestion and search.
pub struct KnowledgeService {
    store: Arc<VectorStore>,
}

impl KnowledgeService {
    /// Builds the service over a vector store.
    pub fn new(store: Arc<VectorStore>) -> Self {
        Self { store }
    }

    /// Validates and ingests pre-chunked documents. Returns the count written.
    pub async fn upload(&self, documents: &[Document]) -> CoreResult<usize> {
        if documents.is_empty() {
            return Err(CoreError::Validation(
                "at least one document is required".to_string(),
            ));
        }
        for document in documents {
            if document.id.trim().is_empty() || document.text.trim().is_empty() {
                return Err(CoreError::Validation(
                    "each document must have an id and text".to_string(),
                ));
            }
        }
        self.store.upsert_documents(documents).await
    }

    /// Searches the knowledge base. `top_k` defaults to
    /// [`DEFAULT_SEARCH_TOP_K`]; an empty filter matches everything.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: Option<Metadata>,
    ) -> CoreResult<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(CoreError::Validation("query is required".to_string()));
        }
        self.store
            .search(query, top_k.unwrap_or(DEFAULT_SEARCH_TOP_K), filter)
            .await
    }

    /// Deletes the given document ids. Returns the count requested.
    pub async fn delete(&self, ids: &[String]) -> CoreResult<usize> {
        if ids.is_empty() {
            return Err(CoreError::Validation(
                "at least one document id is required".to_string(),
            ));
        }
        self.store.delete(ids).await
    }

    /// Aggregate index statistics.
    pub async fn stats(&self) -> CoreResult<IndexStats> {
        self.store.stats().await
    }

    /// Removes every document from the index.
    pub async fn clear(&self) -> CoreResult<()> {
        self.store.clear().await
    }

    /// Splits raw text into sentence-aligned chunks and ingests them as
    /// documents. Chunk ids embed the metadata `source` (or `doc`), the
    /// chunk index, and a creation timestamp; each chunk's metadata gains
    /// `chunk_index` and `total_chunks`.
    pub async fn batch_upload(
        &self,
        text: &str,
        metadata: Metadata,
        chunk_size: Option<usize>,
    ) -> CoreResult<BatchReceipt> {
        if text.trim().is_empty() {
            return Err(CoreError::Validation(
                "text is required for batch upload".to_string(),
            ));
        }
        let chunks = split_into_chunks(text, chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE));
        let source = metadata
            .get("source")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("doc")
            .to_string();
        let stamp = chrono::Utc::now().timestamp_millis();

        let total = chunks.len();
        let mut token_estimate = 0;
        let documents: Vec<Document> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                token_estimate += estimate_tokens(&chunk);
                let mut chunk_metadata = metadata.clone();
                chunk_metadata.insert("chunk_index".to_string(), serde_json::json!(index));
                chunk_metadata.insert("total_chunks".to_string(), serde_json::json!(total));
                Document {
                    id: format!("{source}_chunk_{index}_{stamp}"),
                    text: chunk,
                    metadata: chunk_metadata,
                }
            })
            .collect();

        let written = self.store.upsert_documents(&documents).await?;
        Ok(BatchReceipt {
            chunks: total,
            documents: written,
            token_estimate,
        })
    }
}

/// Outcome of an agent query including the id it ran under.
#[derive(Debug, Clone, Serialize)]
pub struct AgentQueryReply {
    /// Agent the query ran under (created when absent).
    pub agent_id: String,
    /// The agent's reply.
    #[serde(flatten)]
    pub reply: AgentReply,
}

/// Agent lifecycle and query orchestration.
pub struct AgentService {
    registry: AgentRegistry,
    completion: Arc<CompletionClient>,
    store: Arc<VectorStore>,
}

impl AgentService {
    /// Builds the service over a completion client and a vector store.
    pub fn new(completion: Arc<CompletionClient>, store: Arc<VectorStore>) -> Self {
        Self {
            registry: AgentRegistry::new(),
            completion,
            store,
        }
    }

    /// Runs a knowledge-grounded query under the given agent, creating it
    /// with `agent_type` when absent.
    pub async fn query(
        &self,
        agent_id: Option<String>,
        agent_type: AgentType,
        query: &str,
        use_knowledge_base: bool,
    ) -> CoreResult<AgentQueryReply> {
        if query.trim().is_empty() {
            return Err(CoreError::Validation("query is required".to_string()));
        }
        let agent_id = agent_id.unwrap_or_else(|| self.registry.next_agent_id());
        let agent = self.registry.get_or_create(&agent_id, agent_type).await;
        let mut agent = agent.lock().await;
        let reply = agent
            .query_with_knowledge(&self.completion, &self.store, query, use_knowledge_base)
            .await?;
        Ok(AgentQueryReply { agent_id, reply })
    }

    /// Classifies the intent of a query.
    pub async fn analyze(&self, query: &str) -> CoreResult<IntentAnalysis> {
        if query.trim().is_empty() {
            return Err(CoreError::Validation("query is required".to_string()));
        }
        analyze_intent(&self.completion, query).await
    }

    /// Runs a multi-step reasoning task on a fresh, unregistered agent of
    /// the given persona.
    pub async fn multi_step(
        &self,
        agent_type: AgentType,
        task: &str,
        steps: &[String],
    ) -> CoreResult<Reasoning> {
        if task.trim().is_empty() {
            return Err(CoreError::Validation("task is required".to_string()));
        }
        if steps.is_empty() {
            return Err(CoreError::Validation(
                "at least one step is required".to_string(),
            ));
        }
        let agent = Agent::new(agent_type);
        agent
            .multi_step_reasoning(&self.completion, task, steps)
            .await
    }

    /// Registers a fresh agent; returns its id.
    pub async fn create(&self, agent_type: AgentType) -> String {
        self.registry.create(agent_type).await
    }

    /// Retained history of the agent.
    pub async fn history(&self, agent_id: &str) -> CoreResult<Vec<ChatMessage>> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("agent {agent_id} does not exist")))?;
        let agent = agent.lock().await;
        Ok(agent.history().to_vec())
    }

    /// Discards the agent's history, keeping the agent registered.
    pub async fn reset(&self, agent_id: &str) -> CoreResult<()> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("agent {agent_id} does not exist")))?;
        agent.lock().await.reset_history();
        Ok(())
    }

    /// Removes the agent entirely.
    pub async fn delete(&self, agent_id: &str) -> CoreResult<()> {
        if self.registry.remove(agent_id).await {
            Ok(())
        } else {
            Err(CoreError::NotFound(format!(
                "agent {agent_id} does not exist"
            )))
        }
    }

    /// One summary per registered agent.
    pub async fn list(&self) -> Vec<AgentSummary> {
        self.registry.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{BackendResponse, CompletionBackend, CompletionRequest};
    use crate::config::CompletionSettings;
    use crate::embedding::Embedder;
    use crate::vector_store::MemoryIndex;
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    struct EchoBackend {
        fail_stream: bool,
    }

    #[async_trait]
    impl CompletionBackend for EchoBackend {
        async fn complete(&self, request: CompletionRequest) -> Result<BackendResponse> {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(BackendResponse {
                content: format!("echo: {last}"),
                usage: None,
                model: request.model,
            })
        }

        async fn stream(
            &self,
            _request: CompletionRequest,
            on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<()> {
            if self.fail_stream {
                bail!("stream broke");
            }
            on_chunk("streamed ");
            on_chunk("reply");
            Ok(())
        }
    }

    fn chat_service(fail_stream: bool) -> ChatService {
        let client = CompletionClient::with_backend(
            CompletionSettings::default(),
            Arc::new(EchoBackend { fail_stream }),
        );
        ChatService::new(Arc::new(client))
    }

    fn knowledge_service() -> KnowledgeService {
        let store = VectorStore::with_index(Embedder::new(32), Arc::new(MemoryIndex::new(32)));
        KnowledgeService::new(Arc::new(store))
    }

    fn agent_service() -> AgentService {
        let client = CompletionClient::with_backend(
            CompletionSettings::default(),
            Arc::new(EchoBackend { fail_stream: false }),
        );
        let store = VectorStore::with_index(Embedder::new(32), Arc::new(MemoryIndex::new(32)));
        AgentService::new(Arc::new(client), Arc::new(store))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_message_records_both_turns() {
        let chat = chat_service(false);
        let reply = chat.send_message(None, "hello", None, None).await.unwrap();
        assert_eq!(reply.message, "echo: hello");
        let history = chat.history(&reply.session_id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_message_is_rejected() {
        let chat = chat_service(false);
        let err = chat.send_message(None, "  ", None, None).await.expect_err("rejects");
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stream_persists_only_after_success() {
        let chat = chat_service(false);
        let mut collected = String::new();
        let mut on_chunk = |fragment: &str| collected.push_str(fragment);
        let reply = chat
            .stream_message(Some("s1".to_string()), "question", &mut on_chunk)
            .await
            .unwrap();
        assert_eq!(collected, "streamed reply");
        assert_eq!(reply.message, "streamed reply");
        assert_eq!(chat.history("s1").await.len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stream_failure_leaves_session_untouched() {
        let chat = chat_service(true);
        let mut on_chunk = |_: &str| {};
        chat.stream_message(Some("s1".to_string()), "question", &mut on_chunk)
            .await
            .expect_err("stream fails");
        assert!(chat.history("s1").await.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upload_validates_document_shape() {
        let knowledge = knowledge_service();
        let err = knowledge.upload(&[]).await.expect_err("empty rejected");
        assert!(matches!(err, CoreError::Validation(_)));

        let err = knowledge
            .upload(&[Document {
                id: "a".to_string(),
                text: "  ".to_string(),
                metadata: Metadata::new(),
            }])
            .await
            .expect_err("blank text rejected");
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn batch_upload_chunks_and_tags_metadata() {
        let knowledge = knowledge_service();
        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), serde_json::json!("manual"));
        let receipt = knowledge
            .batch_upload("First sentence. Second sentence. Third sentence.", metadata, Some(20))
            .await
            .unwrap();
        assert_eq!(receipt.chunks, 3);
        assert_eq!(receipt.documents, 3);
        assert!(receipt.token_estimate > 0);

        let results = knowledge
            .search("First sentence.", Some(3), None)
            .await
            .unwrap();
        let hit = &results[0];
        assert!(hit.id.starts_with("manual_chunk_"));
        assert_eq!(hit.metadata.get("total_chunks"), Some(&serde_json::json!(3)));
        assert_eq!(hit.metadata.get("source"), Some(&serde_json::json!("manual")));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn agent_query_creates_agent_on_demand() {
        let agents = agent_service();
        let reply = agents
            .query(None, AgentType::Default, "what is rust?", false)
            .await
            .unwrap();
        assert!(reply.agent_id.starts_with("agent_"));
        assert_eq!(agents.history(&reply.agent_id).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_agent_operations_return_not_found() {
        let agents = agent_service();
        assert!(matches!(
            agents.history("nope").await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            agents.reset("nope").await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            agents.delete("nope").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn multi_step_validates_inputs() {
        let agents = agent_service();
        let err = agents
            .multi_step(AgentType::Analytical, "task", &[])
            .await
            .expect_err("empty steps rejected");
        assert!(matches!(err, CoreError::Validation(_)));

        let reasoning = agents
            .multi_step(AgentType::Analytical, "task", &["only step".to_string()])
            .await
            .unwrap();
        assert_eq!(reasoning.steps.len(), 1);
        assert!(!reasoning.final_answer.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reset_keeps_agent_registered() {
        let agents = agent_service();
        let id = agents.create(AgentType::Creative).await;
        agents
            .query(Some(id.clone()), AgentType::Creative, "hi", false)
            .await
            .unwrap();
        agents.reset(&id).await.unwrap();
        assert!(agents.history(&id).await.unwrap().is_empty());
        let listing = agents.list().await;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].agent_type, AgentType::Creative);
    }
}
