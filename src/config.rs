//! Settings shared by the completion client and the vector index adapter.

use std::time::Duration;

/// Knobs for the chat-completion endpoint and its sampling behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    /// Base URL of the OpenAI-compatible completion API.
    pub base_url: String,
    /// Bearer token for the completion API.
    pub api_key: String,
    /// Primary model identifier.
    pub model: String,
    /// Secondary model retried once when the primary attempt fails.
    pub fallback_model: String,
    /// Default sampling temperature.
    pub temperature: f32,
    /// Default completion token budget.
    pub max_tokens: u32,
    /// Default nucleus sampling cutoff.
    pub top_p: f32,
    /// Default frequency penalty.
    pub frequency_penalty: f32,
    /// Default presence penalty.
    pub presence_penalty: f32,
    /// Outbound request timeout.
    pub timeout: Duration,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: String::new(),
            model: "llama-3.3-70b-versatile".to_string(),
            fallback_model: "llama-3.1-8b-instant".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.6,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Knobs for the serverless vector index holding document embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSettings {
    /// API key sent in the `Api-Key` header.
    pub api_key: String,
    /// Index name to connect to (and create when absent).
    pub index_name: String,
    /// Data-plane host override; when set, control-plane lookup is skipped.
    pub host: Option<String>,
    /// Serverless cloud provider for index creation.
    pub cloud: String,
    /// Serverless region for index creation.
    pub region: String,
    /// Embedding dimension the index is created with.
    pub dimension: usize,
    /// Whether to create the index when the control plane does not list it.
    pub create_if_missing: bool,
    /// Fixed delay after index creation before it is considered ready.
    pub settle_delay: Duration,
    /// Outbound request timeout.
    pub timeout: Duration,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            index_name: "knowledge-base".to_string(),
            host: None,
            cloud: "aws".to_string(),
            region: "us-east-1".to_string(),
            dimension: crate::embedding::DEFAULT_DIMENSION,
            create_if_missing: true,
            settle_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}
