use std::path::PathBuf;

use async_trait::async_trait;
use mediaplan::DeliveryMode;
use tracing::warn;

use crate::cancel::JobCancel;
use crate::errors::TransportError;
use crate::types::{ChatId, MessageRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub payload: String,
}

impl Button {
    pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { label: label.into(), payload: payload.into() }
    }
}

/// Rows of inline buttons.
pub type Keyboard = Vec<Vec<Button>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAs {
    Video,
    Document,
    Audio,
}

impl From<DeliveryMode> for SendAs {
    fn from(mode: DeliveryMode) -> Self {
        match mode {
            DeliveryMode::Video => SendAs::Video,
            DeliveryMode::Document => SendAs::Document,
            DeliveryMode::Audio => SendAs::Audio,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub chat_id: ChatId,
    pub path: PathBuf,
    pub file_name: String,
    pub send_as: SendAs,
    pub reply_to: Option<i64>,
}

pub type UploadProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// The chat platform, as far as the engine needs it.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, TransportError>;

    /// `None` clears the keyboard.
    async fn edit_message(&self, msg: MessageRef, text: &str, keyboard: Option<&Keyboard>) -> Result<(), TransportError>;

    async fn delete_message(&self, msg: MessageRef) -> Result<(), TransportError>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), TransportError>;

    /// Streams the file, reporting `(sent, total)` and stopping at the next
    /// chunk once `cancel` fires.
    async fn send_file(
        &self,
        file: &OutgoingFile,
        progress: UploadProgress<'_>,
        cancel: &JobCancel,
    ) -> Result<MessageRef, TransportError>;
}

// Status and notice messages are best effort; a failed edit never fails a job.

pub async fn send_quietly(
    transport: &dyn ChatTransport,
    chat_id: ChatId,
    text: &str,
    reply_to: Option<i64>,
    keyboard: Option<&Keyboard>,
) -> Option<MessageRef> {
    match transport.send_message(chat_id, text, reply_to, keyboard).await {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(chat_id, "send_message failed: {e}");
            None
        }
    }
}

pub async fn edit_quietly(transport: &dyn ChatTransport, msg: MessageRef, text: &str, keyboard: Option<&Keyboard>) {
    if let Err(e) = transport.edit_message(msg, text, keyboard).await {
        warn!(chat_id = msg.chat_id, message_id = msg.message_id, "edit_message failed: {e}");
    }
}

pub async fn delete_quietly(transport: &dyn ChatTransport, msg: MessageRef) {
    if let Err(e) = transport.delete_message(msg).await {
        warn!(chat_id = msg.chat_id, message_id = msg.message_id, "delete_message failed: {e}");
    }
}

pub async fn answer_quietly(transport: &dyn ChatTransport, callback_id: &str, text: Option<&str>) {
    if let Err(e) = transport.answer_callback(callback_id, text).await {
        warn!(callback_id, "answer_callback failed: {e}");
    }
}
