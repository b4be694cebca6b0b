use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("feed parsing error: {0}")]
    Feed(#[from] rss::Error),
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("no extractor registered for {0}")]
    UnsupportedSource(String),
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost(reason.into())
    }

    /// Connectivity failures that abandon the current item but leave the pipeline running.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::HttpStatus { .. }
                | Self::Broker(_)
                | Self::Cache(_)
                | Self::Store(_)
                | Self::ConnectionLost(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(IngestError::connection_lost("closed").is_transient());
        assert!(IngestError::HttpStatus {
            url: "https://x/a".into(),
            status: 503
        }
        .is_transient());
        assert!(!IngestError::UnsupportedSource("https://x/a".into()).is_transient());
        assert!(!IngestError::config("bad").is_transient());
    }
}
