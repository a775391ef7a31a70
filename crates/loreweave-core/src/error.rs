use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoreweaveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Session not found: {uuid}")]
    SessionNotFound { uuid: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("Vector store error: {0}")]
    Vector(String),

    #[error("Graph store error: {0}")]
    Graph(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LoreweaveError>;
