//! Knowledge-grounded agents: persona prompts, bounded history, retrieval
//! grounding, multi-step reasoning, and intent analysis.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::completion::{CompletionClient, CompletionOptions, TokenUsage};
use crate::document::SearchResult;
use crate::error::{CoreError, CoreResult};
use crate::message::{ChatMessage, Role};
use crate::vector_store::VectorStore;

/// User/assistant exchange pairs retained per agent beyond the opening turn.
pub const MAX_HISTORY_PAIRS: usize = 10;

/// Documents retrieved per grounded query.
const KNOWLEDGE_TOP_K: usize = 3;

/// Closed set of agent personas, each with a fixed system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// General-purpose assistant grounded in the knowledge base.
    #[default]
    Default,
    /// Software and systems specialist.
    Technical,
    /// Writing and ideation specialist.
    Creative,
    /// Data analysis and decision-support specialist.
    Analytical,
}

impl AgentType {
    /// System prompt installed as the persona's first message.
    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::Default => {
                "You are an intelligent assistant with these capabilities:\n\
                 1. Answer questions using the provided knowledge base\n\
                 2. Reason and analyze logically\n\
                 3. Give professional, accurate advice\n\
                 4. Keep a friendly, professional tone\n\n\
                 Answering rules:\n\
                 - Prefer information from the knowledge base\n\
                 - When the knowledge base has nothing relevant, answer from general knowledge\n\
                 - Acknowledge uncertainty; never fabricate information\n\
                 - Keep answers concise, clear, and well organized"
            }
            Self::Technical => {
                "You are a technical expert assistant, skilled at:\n\
                 - Programming and software development\n\
                 - System architecture design\n\
                 - Diagnosing and resolving technical problems\n\
                 - Code review and optimization advice\n\n\
                 Provide professional, detailed technical guidance."
            }
            Self::Creative => {
                "You are a creative assistant, skilled at:\n\
                 - Creative writing and content creation\n\
                 - Brainstorming and lateral thinking\n\
                 - Copywriting and marketing advice\n\
                 - Story construction and character design\n\n\
                 Provide imaginative, inspiring suggestions."
            }
            Self::Analytical => {
                "You are a data analysis expert assistant, skilled at:\n\
                 - Data analysis and interpretation\n\
                 - Statistical reasoning\n\
                 - Business insight\n\
                 - Decision support\n\n\
                 Provide in-depth, data-driven analysis and advice."
            }
        }
    }

    /// Wire-format name of the persona.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Technical => "technical",
            Self::Creative => "creative",
            Self::Analytical => "analytical",
        }
    }
}

impl FromStr for AgentType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "technical" => Ok(Self::Technical),
            "creative" => Ok(Self::Creative),
            "analytical" => Ok(Self::Analytical),
            other => Err(CoreError::Validation(format!(
                "unknown agent type: {other}"
            ))),
        }
    }
}

/// Outcome of one grounded agent query.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    /// Assistant answer text.
    pub answer: String,
    /// Whether retrieved documents were folded into the prompt.
    pub knowledge_used: bool,
    /// The documents that grounded the answer, when any were used.
    pub sources: Option<Vec<SearchResult>>,
    /// Usage reported by the completion endpoint.
    pub usage: Option<TokenUsage>,
}

/// One completed reasoning step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// 1-based step number.
    pub step: usize,
    /// Caller-supplied step description.
    pub description: String,
    /// Raw model output for the step.
    pub result: String,
}

/// Outcome of a multi-step reasoning run.
#[derive(Debug, Clone, Serialize)]
pub struct Reasoning {
    /// Synthesized final answer over all steps.
    pub final_answer: String,
    /// Per-step results in execution order.
    pub steps: Vec<StepResult>,
}

/// A conversational agent with a persona and a bounded rolling history.
pub struct Agent {
    agent_type: AgentType,
    history: Vec<ChatMessage>,
}

impl Agent {
    /// Builds an agent of the given persona with an empty history.
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            history: Vec::new(),
        }
    }

    /// Persona of this agent.
    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    /// Retained conversation history, oldest first.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Discards the conversation history; the persona is kept.
    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    // Appends a turn, then evicts the oldest exchange after the opening turn
    // once the history exceeds its cap. The opening turn is pinned so the
    // conversation never loses its original subject.
    fn push_history(&mut self, role: Role, content: &str) {
        self.history.push(ChatMessage::now(role, content));
        if self.history.len() > MAX_HISTORY_PAIRS * 2 + 1 {
            self.history.drain(1..3);
        }
    }

    /// Full message sequence for a completion call: the persona's system
    /// prompt followed by the retained history.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::now(Role::System, self.agent_type.system_prompt()));
        messages.extend(self.history.iter().cloned());
        messages
    }

    /// Answers a query, grounding it in the top retrieved documents when
    /// `use_knowledge_base` is set. Retrieval failure downgrades to an
    /// ungrounded answer rather than failing the whole query; completion
    /// failure propagates. The grounded prompt (not the bare query) enters
    /// the history, so follow-up turns keep the retrieved context.
    pub async fn query_with_knowledge(
        &mut self,
        client: &CompletionClient,
        store: &VectorStore,
        query: &str,
        use_knowledge_base: bool,
    ) -> CoreResult<AgentReply> {
        let mut prompt = query.to_string();
        let mut sources: Option<Vec<SearchResult>> = None;

        if use_knowledge_base {
            match store.search(query, KNOWLEDGE_TOP_K, None).await {
                Ok(results) if !results.is_empty() => {
                    let context = results
                        .iter()
                        .enumerate()
                        .map(|(idx, doc)| format!("[document {}] {}", idx + 1, doc.text))
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    prompt = format!(
                        "Answer the question using the knowledge below.\n\n\
                         {context}\n\n\
                         User question: {query}\n\
                         Base your answer on the knowledge above; if it does not \
                         cover the question, say so explicitly."
                    );
                    sources = Some(results);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "knowledge retrieval failed, answering without grounding");
                }
            }
        }

        self.push_history(Role::User, &prompt);
        let options = CompletionOptions {
            temperature: Some(0.7),
            max_tokens: Some(2000),
            ..Default::default()
        };
        let completion = client.complete(&self.messages(), &options).await?;
        self.push_history(Role::Assistant, &completion.content);

        Ok(AgentReply {
            answer: completion.content,
            knowledge_used: sources.is_some(),
            sources,
            usage: completion.usage,
        })
    }

    /// Runs the steps sequentially, feeding each step's raw output in as the
    /// next step's task context, then synthesizes a final answer over all
    /// step results. Each call sends only the system prompt plus one user
    /// turn; the agent's conversation history is not consulted or updated.
    pub async fn multi_step_reasoning(
        &self,
        client: &CompletionClient,
        task: &str,
        steps: &[String],
    ) -> CoreResult<Reasoning> {
        let mut results: Vec<StepResult> = Vec::with_capacity(steps.len());
        let mut context = task.to_string();
        let total = steps.len();

        for (idx, description) in steps.iter().enumerate() {
            let prompt = format!(
                "Task: {context}\n\n\
                 Current step ({}/{total}): {description}\n\n\
                 Complete this step and provide the result.",
                idx + 1
            );
            let completion = client
                .complete(&self.step_messages(&prompt), &CompletionOptions::default())
                .await?;
            context = completion.content.clone();
            results.push(StepResult {
                step: idx + 1,
                description: description.clone(),
                result: completion.content,
            });
        }

        let transcript = results
            .iter()
            .map(|step| {
                format!(
                    "Step {}: {}\nResult: {}",
                    step.step, step.description, step.result
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let summary_prompt = format!(
            "Produce the final answer from the following reasoning steps:\n\n\
             {transcript}\n\n\
             Provide a combined summary."
        );
        let final_completion = client
            .complete(
                &self.step_messages(&summary_prompt),
                &CompletionOptions::default(),
            )
            .await?;

        Ok(Reasoning {
            final_answer: final_completion.content,
            steps: results,
        })
    }

    fn step_messages(&self, prompt: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::now(Role::System, self.agent_type.system_prompt()),
            ChatMessage::now(Role::User, prompt),
        ]
    }
}

/// Listing row describing one registered agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    /// Agent identifier.
    pub agent_id: String,
    /// Persona of the agent.
    pub agent_type: AgentType,
    /// Number of retained history messages.
    pub history_length: usize,
}

/// Registry of live agents keyed by id.
///
/// Each agent sits behind its own lock so long-running queries on one agent
/// never block operations on another.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, Arc<Mutex<Agent>>>>,
    id_seq: AtomicU64,
}

impl AgentRegistry {
    /// Builds an empty registry.
    pub fn new() -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            id_seq: AtomicU64::new(0),
        }
    }

    /// Synthesizes a fresh agent id.
    pub fn next_agent_id(&self) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("agent_{}_{}", Utc::now().timestamp_millis(), seq)
    }

    /// Looks up an agent by id.
    pub async fn get(&self, agent_id: &str) -> Option<Arc<Mutex<Agent>>> {
        self.agents.lock().await.get(agent_id).cloned()
    }

    /// Returns the agent under `agent_id`, creating one with the given
    /// persona when absent. An existing agent keeps its original persona.
    pub async fn get_or_create(&self, agent_id: &str, agent_type: AgentType) -> Arc<Mutex<Agent>> {
        let mut agents = self.agents.lock().await;
        Arc::clone(
            agents
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Agent::new(agent_type)))),
        )
    }

    /// Registers a fresh agent of the given persona under a new id.
    pub async fn create(&self, agent_type: AgentType) -> String {
        let agent_id = self.next_agent_id();
        self.agents.lock().await.insert(
            agent_id.clone(),
            Arc::new(Mutex::new(Agent::new(agent_type))),
        );
        agent_id
    }

    /// Removes the agent. Returns whether it existed.
    pub async fn remove(&self, agent_id: &str) -> bool {
        self.agents.lock().await.remove(agent_id).is_some()
    }

    /// One summary per registered agent.
    pub async fn list(&self) -> Vec<AgentSummary> {
        let agents = self.agents.lock().await;
        let mut listing = Vec::with_capacity(agents.len());
        for (agent_id, agent) in agents.iter() {
            let agent = agent.lock().await;
            listing.push(AgentSummary {
                agent_id: agent_id.clone(),
                agent_type: agent.agent_type(),
                history_length: agent.history().len(),
            });
        }
        listing
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Classified intent of a user query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    /// Query kind: `question`, `command`, `request`, or `conversation`.
    pub intent: String,
    /// Subject domain: `technical`, `general`, `creative`, or `analytical`.
    pub domain: String,
    /// Difficulty: `simple`, `medium`, or `complex`.
    pub complexity: String,
    /// Whether answering likely needs the knowledge base.
    #[serde(rename = "requiresKnowledge", alias = "requiredKnowledge")]
    pub requires_knowledge: bool,
}

impl Default for IntentAnalysis {
    fn default() -> Self {
        Self {
            intent: "question".to_string(),
            domain: "general".to_string(),
            complexity: "medium".to_string(),
            requires_knowledge: true,
        }
    }
}

/// Classifies a query's intent with a low-temperature completion call.
///
/// The model is asked for JSON; a reply that fails to parse degrades to the
/// default classification rather than failing. Completion failure propagates.
pub async fn analyze_intent(
    client: &CompletionClient,
    query: &str,
) -> CoreResult<IntentAnalysis> {
    let prompt = format!(
        "Analyze the intent of the following user query and reply in JSON:\n\n\
         {{\n\
         \"intent\": \"question|command|request|conversation\",\n\
         \"domain\": \"technical|general|creative|analytical\",\n\
         \"complexity\": \"simple|medium|complex\",\n\
         \"requiresKnowledge\": true|false\n\
         }}\n\n\
         User query: {query}"
    );
    let messages = vec![
        ChatMessage::now(
            Role::System,
            "You are an intent analysis expert. Reply with a JSON analysis only.",
        ),
        ChatMessage::now(Role::User, prompt),
    ];
    let options = CompletionOptions {
        temperature: Some(0.3),
        max_tokens: Some(200),
        ..Default::default()
    };
    let completion = client.complete(&messages, &options).await?;
    Ok(parse_intent_or_default(&completion.content))
}

/// Parses the model's classification, falling back to [`IntentAnalysis::default`]
/// when the reply is not the requested JSON shape.
pub fn parse_intent_or_default(content: &str) -> IntentAnalysis {
    match serde_json::from_str(content.trim()) {
        Ok(analysis) => analysis,
        Err(err) => {
            tracing::debug!(error = %err, "intent reply was not valid JSON, using default classification");
            IntentAnalysis::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{BackendResponse, CompletionBackend, CompletionRequest};
    use crate::config::CompletionSettings;
    use crate::document::Metadata;
    use crate::embedding::Embedder;
    use crate::vector_store::{IndexMatch, IndexStats, MemoryIndex, VectorIndex, VectorRecord};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use crate::document::Document;

    // Records every request and answers from a scripted list, repeating the
    // last entry once the script runs out.
    struct ScriptedBackend {
        replies: Vec<String>,
        requests: std::sync::Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedBackend {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|s| s.to_string()).collect(),
                requests: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, request: CompletionRequest) -> Result<BackendResponse> {
            let mut requests = self.requests.lock().unwrap();
            let reply = self
                .replies
                .get(requests.len())
                .or_else(|| self.replies.last())
                .cloned()
                .unwrap_or_default();
            let model = request.model.clone();
            requests.push(request);
            Ok(BackendResponse {
                content: reply,
                usage: None,
                model,
            })
        }

        async fn stream(
            &self,
            _request: CompletionRequest,
            _on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<()> {
            bail!("not used in these tests")
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl VectorIndex for BrokenIndex {
        async fn upsert(&self, _vectors: Vec<VectorRecord>) -> Result<()> {
            bail!("index unavailable")
        }

        async fn query(
            &self,
            _vector: Vec<f32>,
            _top_k: usize,
            _filter: Option<Metadata>,
        ) -> Result<Vec<IndexMatch>> {
            bail!("index unavailable")
        }

        async fn delete_many(&self, _ids: &[String]) -> Result<()> {
            bail!("index unavailable")
        }

        async fn delete_all(&self) -> Result<()> {
            bail!("index unavailable")
        }

        async fn describe_stats(&self) -> Result<IndexStats> {
            bail!("index unavailable")
        }
    }

    fn client(backend: Arc<ScriptedBackend>) -> CompletionClient {
        CompletionClient::with_backend(CompletionSettings::default(), backend)
    }

    fn memory_store() -> VectorStore {
        VectorStore::with_index(Embedder::new(32), Arc::new(MemoryIndex::new(32)))
    }

    #[test]
    fn unknown_agent_type_is_rejected() {
        let err = "wizard".parse::<AgentType>().expect_err("rejects");
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!("technical".parse::<AgentType>().unwrap(), AgentType::Technical);
    }

    #[test]
    fn history_cap_pins_the_opening_turn() {
        let mut agent = Agent::new(AgentType::Default);
        agent.push_history(Role::User, "opening question");
        for i in 0..MAX_HISTORY_PAIRS * 3 {
            agent.push_history(Role::Assistant, &format!("turn {i}"));
        }
        assert_eq!(agent.history().len(), MAX_HISTORY_PAIRS * 2 + 1);
        assert_eq!(agent.history()[0].content, "opening question");
    }

    #[test]
    fn intent_parse_falls_back_to_default() {
        let parsed = parse_intent_or_default("Sorry, I cannot produce JSON.");
        assert_eq!(parsed, IntentAnalysis::default());

        let parsed = parse_intent_or_default(
            r#"{"intent":"command","domain":"technical","complexity":"complex","requiredKnowledge":false}"#,
        );
        assert_eq!(parsed.intent, "command");
        assert!(!parsed.requires_knowledge);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn grounded_query_cites_retrieved_documents() {
        let store = memory_store();
        store
            .upsert_documents(&[Document {
                id: "d1".to_string(),
                text: "the capital of France is Paris".to_string(),
                metadata: Metadata::new(),
            }])
            .await
            .unwrap();
        let backend = Arc::new(ScriptedBackend::new(&["Paris."]));
        let client = client(Arc::clone(&backend));
        let mut agent = Agent::new(AgentType::Default);

        let reply = agent
            .query_with_knowledge(&client, &store, "capital of France?", true)
            .await
            .unwrap();
        assert!(reply.knowledge_used);
        assert_eq!(reply.sources.as_ref().unwrap().len(), 1);

        let sent = backend.requests();
        let user_turn = &sent[0].messages.last().unwrap().content;
        assert!(user_turn.contains("[document 1] the capital of France is Paris"));
        assert!(user_turn.contains("capital of France?"));
        // the grounded prompt, not the bare query, stays in history
        assert!(agent.history()[0].content.contains("[document 1]"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn retrieval_failure_degrades_to_ungrounded_answer() {
        let store = VectorStore::with_index(Embedder::new(32), Arc::new(BrokenIndex));
        let backend = Arc::new(ScriptedBackend::new(&["best effort answer"]));
        let client = client(Arc::clone(&backend));
        let mut agent = Agent::new(AgentType::Default);

        let reply = agent
            .query_with_knowledge(&client, &store, "anything", true)
            .await
            .unwrap();
        assert!(!reply.knowledge_used);
        assert!(reply.sources.is_none());
        assert_eq!(reply.answer, "best effort answer");
        assert_eq!(agent.history()[0].content, "anything");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn knowledge_base_can_be_bypassed() {
        let store = memory_store();
        store
            .upsert_documents(&[Document {
                id: "d1".to_string(),
                text: "irrelevant".to_string(),
                metadata: Metadata::new(),
            }])
            .await
            .unwrap();
        let backend = Arc::new(ScriptedBackend::new(&["answer"]));
        let client = client(Arc::clone(&backend));
        let mut agent = Agent::new(AgentType::Default);

        let reply = agent
            .query_with_knowledge(&client, &store, "hello", false)
            .await
            .unwrap();
        assert!(!reply.knowledge_used);
        assert!(!backend.requests()[0]
            .messages
            .last()
            .unwrap()
            .content
            .contains("[document"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reasoning_steps_chain_context_forward() {
        let backend = Arc::new(ScriptedBackend::new(&[
            "step one outcome",
            "step two outcome",
            "combined summary",
        ]));
        let client = client(Arc::clone(&backend));
        let agent = Agent::new(AgentType::Analytical);

        let reasoning = agent
            .multi_step_reasoning(
                &client,
                "audit the quarterly numbers",
                &["collect figures".to_string(), "compare to forecast".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(reasoning.steps.len(), 2);
        assert_eq!(reasoning.steps[0].result, "step one outcome");
        assert_eq!(reasoning.final_answer, "combined summary");

        let sent = backend.requests();
        assert_eq!(sent.len(), 3);
        let first = &sent[0].messages.last().unwrap().content;
        assert!(first.contains("Task: audit the quarterly numbers"));
        assert!(first.contains("(1/2)"));
        // second step's task context is the first step's raw output
        let second = &sent[1].messages.last().unwrap().content;
        assert!(second.contains("Task: step one outcome"));
        let summary = &sent[2].messages.last().unwrap().content;
        assert!(summary.contains("Step 1: collect figures"));
        assert!(summary.contains("Result: step two outcome"));
        // step calls never carry conversation history
        assert_eq!(sent[0].messages.len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn intent_analysis_uses_low_temperature() {
        let backend = Arc::new(ScriptedBackend::new(&[
            r#"{"intent":"request","domain":"creative","complexity":"simple","requiresKnowledge":false}"#,
        ]));
        let client = client(Arc::clone(&backend));
        let analysis = analyze_intent(&client, "write me a poem").await.unwrap();
        assert_eq!(analysis.intent, "request");
        assert!(!analysis.requires_knowledge);
        let sent = backend.requests();
        assert!((sent[0].temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(sent[0].max_tokens, 200);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registry_get_or_create_keeps_existing_persona() {
        let registry = AgentRegistry::new();
        let id = registry.create(AgentType::Technical).await;
        let same = registry.get_or_create(&id, AgentType::Creative).await;
        assert_eq!(same.lock().await.agent_type(), AgentType::Technical);
        assert!(registry.remove(&id).await);
        assert!(registry.get(&id).await.is_none());
    }
}
