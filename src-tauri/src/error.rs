use crate::models::WorkerStatus;
use thiserror::Error;

/// Failures while bringing the worker up. Never leaves the supervisor:
/// `start` turns them into an `Exited` state.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn worker `{executable}`: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker was spawned without a piped {0}")]
    MissingPipe(&'static str),

    #[error("failed to start worker {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum OutboundError {
    #[error("failed to serialize command: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("serialized command spans more than one line")]
    EmbeddedNewline,
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("worker is not running ({0:?})")]
    NotRunning(WorkerStatus),

    #[error(transparent)]
    Encode(#[from] OutboundError),

    #[error("worker stdin is closed")]
    StdinClosed,
}

/// Errors the UI can observe. Only caller mistakes and the explicit
/// invoke/open operations produce these; worker trouble never does.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    #[error("channel `{0}` is not available to the UI")]
    NotSubscribable(String),

    #[error("no handler registered for `{0}`")]
    NoHandler(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("refusing to open `{0}` urls")]
    UnsupportedScheme(String),

    #[error("failed to open url: {0}")]
    Open(String),
}
