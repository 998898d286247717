use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("path component contains the reserved separator '::': {0}")]
    ReservedSeparator(String),

    #[error("invalid display path: {0}")]
    InvalidDisplayPath(String),

    #[error("unknown routing key: {0}")]
    UnknownRoutingKey(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}
