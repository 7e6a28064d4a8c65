#![warn(missing_docs)]
//! Core library for retrieval-augmented chat: deterministic embeddings, a
//! vector knowledge base, bounded chat sessions, and knowledge-grounded
//! agents over an OpenAI-compatible completion endpoint.

pub mod agent;
pub mod chunker;
pub mod completion;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod message;
pub mod service;
pub mod session;
pub mod vector_store;

pub use agent::{Agent, AgentRegistry, AgentType, IntentAnalysis};
pub use chunker::split_into_chunks;
pub use completion::{Completion, CompletionClient, CompletionOptions, TokenUsage};
pub use config::{CompletionSettings, IndexSettings};
pub use document::{Document, Metadata, SearchResult};
pub use embedding::{Embedder, DEFAULT_DIMENSION};
pub use error::{CoreError, CoreResult};
pub use message::{estimate_tokens, ChatMessage, Role};
pub use service::{AgentService, ChatService, KnowledgeService};
pub use session::{SessionStore, MAX_SESSION_MESSAGES};
pub use vector_store::{MemoryIndex, VectorIndex, VectorStore};
