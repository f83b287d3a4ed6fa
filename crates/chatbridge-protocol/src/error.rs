use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("policy violation: {0}")]
    Policy(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("job canceled: {0}")]
    Canceled(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
