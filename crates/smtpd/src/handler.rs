use crate::message::Message;
use async_trait::async_trait;
use thiserror::Error;

/// The SMTP envelope accumulated by MAIL and RCPT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Empty for the null reverse-path
    pub sender: String,
    pub recipients: Vec<String>,
}

/// Returned by a [MessageHandler] to refuse a message.
/// The code and message are relayed to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {message}")]
pub struct HandlerError {
    pub code: u16,
    pub message: String,
}

impl HandlerError {
    /// A transient (451) failure
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            code: 451,
            message: message.into(),
        }
    }

    pub fn with_code<S: Into<String>>(code: u16, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Receives each message that completes the DATA phase.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, message: &Message) -> Result<(), HandlerError>;
}
