//! The `Channel.Send(chatID, text)` collaborator (spec §2, §6).

pub mod telegram;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// One inbound user message, as delivered by the channel (spec §6). Shared
/// across transports so Admission depends on this, not a Telegram-specific
/// update type.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Channel-scoped user identifier.
    pub user_id: String,
    /// The chat to reply to.
    pub chat_id: String,
    /// The provider's message id, for diagnostics.
    pub message_id: i32,
    /// The raw message text.
    pub text: String,
    /// When the provider recorded the message.
    pub timestamp: DateTime<Utc>,
}

/// Errors sending an outbound message.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport failed to deliver the message.
    #[error("failed to send message to {chat_id}: {source}")]
    Send {
        /// The destination chat.
        chat_id: String,
        /// Underlying transport error.
        #[source]
        source: anyhow::Error,
    },
}

/// Abstract outbound messaging collaborator.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send `text` to `chat_id`.
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;
}
