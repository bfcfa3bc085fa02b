#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("privilege error: {0}")]
    Privilege(String),

    #[error("signal error: {0}")]
    Signal(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("queue error: {0}")]
    Queue(#[from] jobqueue::QueueError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
