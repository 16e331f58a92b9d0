use thiserror::Error;

/// Errors produced while parsing the scanning wire protocol. A protocol
/// error is reported back to the client on the same connection and then the
/// connection is closed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed command line: {0}")]
    BadCommandLine(String),
    #[error("malformed header: {0}")]
    BadHeader(String),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("unsupported protocol version: {0}")]
    BadVersion(String),
}

/// Errors from the persistent statfile store. Corruption is fatal for the
/// affected statfile only; filters depending on it degrade to a neutral
/// contribution.
#[derive(Debug, Error)]
pub enum StatfileError {
    #[error("statfile corrupt: {0}")]
    Corrupt(String),
    #[error("statfile i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message has no header/body separator")]
    NoBody,
    #[error("bad header line: {0}")]
    BadHeader(String),
    #[error("invalid content encoding: {0}")]
    BadEncoding(String),
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("unknown classifier: {0}")]
    UnknownClassifier(String),
    #[error("learn failed: {0}")]
    Learn(String),
    #[error(transparent)]
    Statfile(#[from] StatfileError),
}

/// Task-level error taxonomy. Every variant maps to a reply on the wire,
/// never to a worker abort.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("read timed out")]
    Timeout,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl TaskError {
    /// Numeric code recorded on the task and echoed in the error reply.
    pub fn code(&self) -> u16 {
        match self {
            TaskError::Protocol(_) => 400,
            TaskError::Decode(_) => 422,
            TaskError::Timeout => 408,
            TaskError::Io(_) => 500,
        }
    }
}

/// Control channel authorization failure: the handler is never executed.
#[derive(Debug, Error)]
#[error("command requires authorization")]
pub struct AuthError;
