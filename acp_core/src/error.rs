use thiserror::Error;

/// Errors surfaced to the engine through the response envelopes.
///
/// Every variant is recoverable: the dispatcher converts it into a
/// `Status:false` / `error:true` reply and keeps serving.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The command is not valid in the current agent or publisher state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A monitor with this name is already running.
    #[error("Monitor '{0}' is already started")]
    DuplicateMonitor(String),

    /// The request path does not name a known command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Malformed JSON, base64 or query parameters.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The publisher's underlying channel failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// A monitor or publisher backend rejected the operation.
    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

impl AgentError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        AgentError::InvalidState(msg.into())
    }

    /// Short, stable name of the variant for log fields. Envelopes carry the
    /// `Display` text instead.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::InvalidState(_) => "InvalidState",
            AgentError::DuplicateMonitor(_) => "DuplicateMonitor",
            AgentError::UnknownCommand(_) => "UnknownCommand",
            AgentError::Decode(_) => "DecodeError",
            AgentError::Io(_) => "IoError",
            AgentError::Collaborator(_) => "CollaboratorError",
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Decode(format!("JSON: {err}"))
    }
}

impl From<base64::DecodeError> for AgentError {
    fn from(err: base64::DecodeError) -> Self {
        AgentError::Decode(format!("base64: {err}"))
    }
}

/// Failures reported by a [`Publisher`](crate::publisher::Publisher) backend.
#[derive(Error, Debug)]
pub enum PublisherError {
    /// The channel's transport failed (connect, read, write).
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// The publisher class does not implement this action.
    #[error("The {class} publisher does not support {action} actions")]
    NotSupported {
        class: &'static str,
        action: &'static str,
    },

    /// A required argument was missing or could not be parsed.
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// Any other backend failure.
    #[error("{0}")]
    Failed(String),
}

impl From<PublisherError> for AgentError {
    fn from(err: PublisherError) -> Self {
        match err {
            PublisherError::Io(e) => AgentError::Io(e.to_string()),
            other => AgentError::Collaborator(other.to_string()),
        }
    }
}
