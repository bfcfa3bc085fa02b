#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("invalid queue key: {0:?}")]
    InvalidKey(String),

    #[error("observer error: {0}")]
    Observer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
