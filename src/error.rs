//! Error types for the simulflow runtime.

/// Top-level error type for the dataflow runtime.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Processor configuration rejected during construction.
    #[error("config error: {0}")]
    Config(String),

    /// Graph topology or lifecycle error.
    #[error("graph error: {0}")]
    Graph(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// LLM provider request or streaming error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Malformed wire data (SSE chunk, transport message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tool invocation error.
    #[error("tool error: {0}")]
    Tool(String),

    /// Transport serialization error.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, FlowError>;
