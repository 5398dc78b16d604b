// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ connection failed after {attempts} attempts, giving up")]
    ConnectionExhausted { attempts: u32 },

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Queue declaration failed for '{queue}': {reason}")]
    DeclareError { queue: String, reason: String },

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Connection supervisor is closed")]
    Closed,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Whether the connect loop may try again after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::TimeoutError(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match error {
            LapinError::IOError(_) | LapinError::InvalidConnectionState(_) => {
                RabbitMQError::ConnectionError(error_text)
            }
            LapinError::InvalidChannelState(_) | LapinError::ChannelsLimitReached => {
                RabbitMQError::ChannelError(error_text)
            }
            // Broker-side refusals (bad vhost, auth, precondition) are not retried
            LapinError::ProtocolError(_) => RabbitMQError::Unknown(error_text),
            _ => {
                // Use string representation for what the variants don't tell us
                if error_text.contains("connection") {
                    RabbitMQError::ConnectionError(error_text)
                } else if error_text.contains("channel") {
                    RabbitMQError::ChannelError(error_text)
                } else {
                    RabbitMQError::Unknown(error_text)
                }
            }
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

impl From<String> for RabbitMQError {
    fn from(message: String) -> Self {
        RabbitMQError::Unknown(message)
    }
}

impl From<&str> for RabbitMQError {
    fn from(message: &str) -> Self {
        RabbitMQError::Unknown(message.to_string())
    }
}
