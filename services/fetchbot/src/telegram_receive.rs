//! Bot API long polling (`getUpdates`).

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::handle_inbound;
use crate::state::SharedState;
use crate::types::{Inbound, MessageRef, Sender};

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;
/// Must exceed the poll timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(POLL_TIMEOUT_SECS + 10);
const ERROR_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    #[serde(default)]
    update_id: Option<i64>,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: TgChat,
    #[serde(default)]
    from: Option<TgUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(default, rename = "type")]
    chat_type: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    data: Option<String>,
}

/// Polls until `shutdown` fires, handing each event to its own task.
pub async fn telegram_receive_loop(state: SharedState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    let updates_url = build_get_updates_url(&state.config.api_base, &state.config.bot_token);
    info!("telegram receive loop started");

    let mut offset: Option<i64> = None;
    let mut consecutive_errors: u32 = 0;

    loop {
        let request_url = build_poll_request_url(&updates_url, offset);
        let polled = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = poll_once(&client, &request_url) => polled,
        };

        match polled {
            Ok(updates) => {
                if consecutive_errors > 0 {
                    info!(consecutive_errors, "telegram receive loop recovered");
                    consecutive_errors = 0;
                }
                for update in updates {
                    offset = next_offset_after_update(offset, update.update_id);
                    let Some(event) = to_inbound(update) else {
                        continue;
                    };
                    let st = state.clone();
                    tokio::spawn(handle_inbound(st, event));
                }
            }
            Err(message) => {
                consecutive_errors += 1;
                if consecutive_errors <= 3 {
                    warn!("getUpdates failed: {message}");
                } else if consecutive_errors == 4 {
                    warn!("getUpdates errors continuing (suppressing further logs until recovery)");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    info!("telegram receive loop shutting down");
    Ok(())
}

async fn poll_once(client: &reqwest::Client, url: &str) -> Result<Vec<Update>, String> {
    let resp = client.get(url).send().await.map_err(|e| classify_transport_error(&e).to_string())?;
    let status = resp.status();
    if !status.is_success() {
        return Err(format!("HTTP {status}"));
    }
    let payload: GetUpdatesResponse = resp
        .json()
        .await
        .map_err(|e| format!("failed to parse getUpdates response: {e}"))?;
    if !payload.ok {
        return Err(payload.description.unwrap_or_else(|| "getUpdates returned ok=false".to_string()));
    }
    debug!(count = payload.result.len(), "updates received");
    Ok(payload.result)
}

fn build_get_updates_url(base_url: &str, bot_token: &str) -> String {
    let base = base_url.trim_end_matches('/');
    format!("{base}/bot{bot_token}/getUpdates")
}

fn build_poll_request_url(base_url: &str, offset: Option<i64>) -> String {
    let mut url = format!("{base_url}?timeout={POLL_TIMEOUT_SECS}&allowed_updates=%5B%22message%22%2C%22callback_query%22%5D");
    if let Some(offset) = offset {
        url.push_str("&offset=");
        url.push_str(&offset.to_string());
    }
    url
}

fn next_offset_after_update(current: Option<i64>, update_id: Option<i64>) -> Option<i64> {
    let Some(update_id) = update_id else {
        return current;
    };
    let next = update_id.saturating_add(1);
    Some(current.map_or(next, |current_value| current_value.max(next)))
}

fn classify_transport_error(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "request timeout"
    } else if err.is_connect() {
        "connection error"
    } else {
        "request failed"
    }
}

fn sender(user: &TgUser) -> Sender {
    Sender { id: user.id, username: user.username.clone() }
}

/// Text messages from people, and button presses.
fn to_inbound(update: Update) -> Option<Inbound> {
    if let Some(query) = update.callback_query {
        return Some(Inbound::Callback {
            message: query
                .message
                .as_ref()
                .map(|m| MessageRef { chat_id: m.chat.id, message_id: m.message_id }),
            from: sender(&query.from),
            id: query.id,
            data: query.data.unwrap_or_default(),
        });
    }

    let message = update.message?;
    let from = message.from.as_ref().filter(|u| !u.is_bot)?;
    let text = message
        .text
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| message.caption.clone().filter(|t| !t.is_empty()))?;
    Some(Inbound::Text {
        message: MessageRef { chat_id: message.chat.id, message_id: message.message_id },
        from: sender(from),
        private: message.chat.chat_type.as_deref() == Some("private"),
        chat_title: message.chat.title.clone(),
        text,
    })
}
