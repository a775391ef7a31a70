use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("no embedding capability configured")]
    NoEmbedder,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VectorError>;
