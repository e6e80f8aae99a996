use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonkeyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invoker error: {0}")]
    Invoker(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Agent is shut down")]
    ShutDown,
}

pub type MonkeyResult<T> = Result<T, MonkeyError>;
