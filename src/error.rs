use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("{operation} is not allowed for endpoint {source_id}")]
    RoleMisuse {
        source_id: String,
        operation: &'static str,
    },
    #[error("handler error: {0}")]
    Handler(String),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
