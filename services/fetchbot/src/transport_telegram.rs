use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, StatusCode};
use serde_json::{json, Value};
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::cancel::JobCancel;
use crate::errors::TransportError;
use crate::transport::{ChatTransport, Keyboard, OutgoingFile, SendAs, UploadProgress};
use crate::types::{ChatId, MessageRef};

const API_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_CHUNK: usize = 256 * 1024;

/// Bot API adapter.
pub struct TelegramTransport {
    client: reqwest::Client,
    base_url: String,
    bot_token: String,
}

impl TelegramTransport {
    pub fn new(base_url: impl Into<String>, bot_token: impl Into<String>) -> Result<Self, TransportError> {
        // no global timeout: uploads run as long as they need
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, base_url: base_url.into(), bot_token: bot_token.into() })
    }

    fn api_url(&self, method: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{}/bot{}/{}", base, self.bot_token, method)
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, TransportError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .timeout(API_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        parse_response(status, &text)
    }
}

/// Unwraps `{ok, result, description}`.
fn parse_response(status: StatusCode, body_text: &str) -> Result<Value, TransportError> {
    let parsed: Value = serde_json::from_str(body_text).unwrap_or(Value::Null);
    let ok = parsed.get("ok").and_then(|v| v.as_bool()).unwrap_or(status.is_success());
    if ok {
        return Ok(parsed.get("result").cloned().unwrap_or(Value::Null));
    }
    let description = parsed
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| (!body_text.is_empty()).then(|| body_text.to_string()))
        .unwrap_or_else(|| format!("HTTP {status}"));
    Err(TransportError::Api(description))
}

fn message_ref(result: &Value, fallback_chat: ChatId) -> Result<MessageRef, TransportError> {
    let message_id = result
        .get("message_id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| TransportError::Api("response has no message_id".to_string()))?;
    let chat_id = result
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(|v| v.as_i64())
        .unwrap_or(fallback_chat);
    Ok(MessageRef { chat_id, message_id })
}

fn keyboard_json(keyboard: Option<&Keyboard>) -> Value {
    let rows: Vec<Value> = keyboard
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    Value::Array(
                        row.iter()
                            .map(|b| json!({ "text": b.label, "callback_data": b.payload }))
                            .collect(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "inline_keyboard": rows })
}

fn upload_target(send_as: SendAs) -> (&'static str, &'static str, &'static str) {
    match send_as {
        SendAs::Video => ("sendVideo", "video", "video/mp4"),
        SendAs::Document => ("sendDocument", "document", "application/octet-stream"),
        SendAs::Audio => ("sendAudio", "audio", "audio/mpeg"),
    }
}

/// File chunks for a streamed upload. Stops with `Interrupted` at the first
/// chunk boundary after cancellation and publishes the running byte count.
fn guarded_chunks<R>(
    reader: R,
    capacity: usize,
    cancel: JobCancel,
    sent_tx: watch::Sender<u64>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static
where
    R: AsyncRead + Send + Sync + 'static,
{
    let mut sent: u64 = 0;
    ReaderStream::with_capacity(reader, capacity).map(move |chunk| {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "upload cancelled"));
        }
        let chunk: Bytes = chunk?;
        sent += chunk.len() as u64;
        let _ = sent_tx.send(sent);
        Ok(chunk)
    })
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(reply_to) = reply_to {
            body["reply_to_message_id"] = json!(reply_to);
        }
        if keyboard.is_some() {
            body["reply_markup"] = keyboard_json(keyboard);
        }
        let result = self.call("sendMessage", body).await?;
        message_ref(&result, chat_id)
    }

    async fn edit_message(&self, msg: MessageRef, text: &str, keyboard: Option<&Keyboard>) -> Result<(), TransportError> {
        let body = json!({
            "chat_id": msg.chat_id,
            "message_id": msg.message_id,
            "text": text,
            "disable_web_page_preview": true,
            "reply_markup": keyboard_json(keyboard),
        });
        match self.call("editMessageText", body).await {
            Ok(_) => Ok(()),
            Err(TransportError::Api(d)) if d.contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<(), TransportError> {
        self.call("deleteMessage", json!({ "chat_id": msg.chat_id, "message_id": msg.message_id }))
            .await
            .map(|_| ())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), TransportError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        self.call("answerCallbackQuery", body).await.map(|_| ())
    }

    async fn send_file(
        &self,
        file: &OutgoingFile,
        progress: UploadProgress<'_>,
        cancel: &JobCancel,
    ) -> Result<MessageRef, TransportError> {
        let handle = tokio::fs::File::open(&file.path).await?;
        let total = handle.metadata().await?.len();
        let (method, field, mime) = upload_target(file.send_as);
        info!(%method, path = %file.path.display(), total, "upload start");

        let (sent_tx, mut sent_rx) = watch::channel(0u64);
        let stream = guarded_chunks(handle, UPLOAD_CHUNK, cancel.clone(), sent_tx);

        let part = Part::stream_with_length(Body::wrap_stream(stream), total)
            .file_name(file.file_name.clone())
            .mime_str(mime)?;
        let mut form = Form::new().text("chat_id", file.chat_id.to_string()).part(field, part);
        if let Some(reply_to) = file.reply_to {
            form = form.text("reply_to_message_id", reply_to.to_string());
        }
        if file.send_as == SendAs::Video {
            form = form.text("supports_streaming", "true");
        }

        let request = self.client.post(self.api_url(method)).multipart(form).send();
        tokio::pin!(request);
        let mut watching = true;

        let resp = loop {
            tokio::select! {
                res = &mut request => break res,
                changed = sent_rx.changed(), if watching => match changed {
                    Ok(()) => {
                        let now = *sent_rx.borrow_and_update();
                        progress(now, total);
                    }
                    Err(_) => watching = false,
                },
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        };

        let resp = match resp {
            Ok(resp) => resp,
            Err(_) if cancel.is_cancelled() => return Err(TransportError::Cancelled),
            Err(e) => return Err(e.into()),
        };
        let status = resp.status();
        let text = resp.text().await?;
        let result = parse_response(status, &text)?;
        debug!(%method, "upload done");
        message_ref(&result, file.chat_id)
    }
}
