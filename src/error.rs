use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device driver error: {0}")]
    Driver(String),

    #[error("Vision service error: {0}")]
    Vision(String),

    #[error("LLM gateway error: {0}")]
    Llm(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    /// Fatal errors abort the run immediately and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Config(_))
    }
}
