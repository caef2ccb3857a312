//! The one concrete [`Channel`](super::Channel): a Telegram bot via `teloxide`.
//!
//! Mirrors the teacher's Telegram adapter shape: a thin struct wrapping
//! `teloxide::Bot` for outbound sends, plus a listener that forwards
//! inbound updates onto an `mpsc` channel for the Admission Front to drain
//! — keeping the dispatch loop itself outside the `Channel` trait, since
//! only `Send` is part of the engine's abstract collaborator surface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;

use super::{Channel, ChannelError, InboundMessage};

/// The Telegram [`Channel`] implementation.
pub struct TelegramChannel {
    bot: Bot,
}

impl TelegramChannel {
    /// Build a channel from a bot token.
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(bot_token.into()),
        }
    }

    /// Start receiving updates, forwarding each text message onto `tx`.
    /// Runs until the process exits; non-text updates are ignored.
    pub async fn run_listener(self: std::sync::Arc<Self>, tx: mpsc::Sender<InboundMessage>) {
        let handler = Update::filter_message().endpoint(
            move |msg: Message, tx: mpsc::Sender<InboundMessage>| async move {
                if let Some(text) = msg.text() {
                    let inbound = InboundMessage {
                        user_id: msg.chat.id.0.to_string(),
                        chat_id: msg.chat.id.0.to_string(),
                        message_id: msg.id.0,
                        text: text.to_owned(),
                        timestamp: DateTime::from_timestamp(msg.date.timestamp(), 0)
                            .unwrap_or_else(Utc::now),
                    };
                    let _ = tx.send(inbound).await;
                }
                respond(())
            },
        );

        Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![tx])
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let id: i64 = chat_id.parse().map_err(|e| ChannelError::Send {
            chat_id: chat_id.to_owned(),
            source: anyhow::anyhow!("invalid chat id {chat_id:?}: {e}"),
        })?;

        self.bot
            .send_message(ChatId(id), text)
            .await
            .map_err(|e| ChannelError::Send {
                chat_id: chat_id.to_owned(),
                source: e.into(),
            })?;
        Ok(())
    }
}
