use shared::{domain::MessageId, error::GatewayError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no conversation is selected")]
    NoActiveConversation,
    #[error("message body is empty")]
    EmptyMessage,
    #[error("message {0} is not in the active conversation")]
    MessageNotFound(MessageId),
    #[error("role {role} may not {action}")]
    Forbidden { role: &'static str, action: &'static str },
    #[error("message {0} has not been confirmed by the server yet")]
    Unconfirmed(MessageId),
    #[error("message {0} is not awaiting a retry")]
    NotRetryable(MessageId),
    #[error("session has been shut down")]
    SessionClosed,
    #[error("gateway request failed: {0}")]
    Gateway(#[from] GatewayError),
}

pub type ChatResult<T> = Result<T, ChatError>;
