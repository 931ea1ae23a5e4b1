use thiserror::Error;

/// Errors surfaced to callers of the parser, interpreter, and orchestrator.
#[derive(Error, Debug, Clone)]
pub enum StatechartError {
    #[error("malformed definition at {path}: {message}")]
    MalformedDefinition { path: String, message: String },

    #[error("unknown action or guard handler: {name}")]
    UnknownHandler { name: String },

    #[error("machine is not running")]
    NotRunning,

    #[error("send timed out waiting for the committed configuration")]
    Timeout,

    #[error("no machine registered under id: {id}")]
    UnknownTarget { id: String },

    #[error("mailbox for {id} is full")]
    MailboxFull { id: String },

    #[error("action failed during exit of {state}: {message}")]
    ActionFailedDuringExit { state: String, message: String },

    #[error("action failed during entry of {state}: {message}")]
    ActionFailedDuringEntry { state: String, message: String },

    #[error("machine id already registered: {id}")]
    DuplicateId { id: String },

    #[error("machine has faulted and only accepts stop()")]
    Faulted,
}

pub type Result<T> = std::result::Result<T, StatechartError>;
