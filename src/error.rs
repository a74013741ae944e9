use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    /// A single endpoint could not be reached or answered badly.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Missing endpoints, unknown size class, invalid config value.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("State file error: {0}")]
    Persistence(String),

    #[error("Mirror discovery failed: {0}")]
    Discovery(String),

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl MirrorError {
    /// Errors that only concern one endpoint and never abort a cycle.
    pub fn is_transport(&self) -> bool {
        matches!(self, MirrorError::Transport(_) | MirrorError::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
