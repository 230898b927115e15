//! User-facing message texts.

use mediaplan::{fmt_bytes, PlanBook, Refusal};

use crate::transport::{Button, Keyboard};
use crate::types::Callback;

pub const GETTING_INFO: &str = "Getting info...";
pub const INVALID_URL: &str = "Invalid URL";
pub const UNSUPPORTED_URL: &str = "Invalid URL or unsupported website.";
pub const EXPIRED: &str = "Request expired. Send the link again.";
pub const GONE: &str = "This request is no longer available. Send the link again.";
pub const ALREADY_CLAIMED: &str = "This request is already being processed.";
pub const NOT_YOURS: &str = "This is not your request.";
pub const QUEUE_FULL: &str = "Too many downloads right now. Please try again later.";
pub const NOTHING_TO_CANCEL: &str = "Nothing to cancel.";
pub const CANCELLED_ACK: &str = "Cancelled.";
pub const INVALID_ACTION: &str = "Invalid action";
pub const NOT_OFFERED: &str = "This option is not available.";
pub const ACCEPTED: &str = "OK";

pub fn help(limit: u64) -> String {
    format!(
        "Send me a video link and I'll download it for you.\n\n\
         You can choose:\n\
         • Video\n\
         • Document (original file)\n\
         • Audio (MP3)\n\n\
         Upload limit: {}",
        fmt_bytes(Some(limit))
    )
}

/// Text shown with the choice buttons, or the refusal when nothing fits.
pub fn offer(title: &str, book: &PlanBook, limit: u64) -> String {
    let limit_text = fmt_bytes(Some(limit));
    let mut out = format!("{title}\n\n");

    match &book.video {
        Ok(plan) => {
            out.push_str("Choose download method:\n");
            out.push_str(&format!(
                "Estimated size: {} (limit {limit_text})\nSelected: {}",
                fmt_bytes(plan.size.bytes()),
                plan.quality_label
            ));
            if let Ok(audio) = &book.audio {
                out.push_str(&format!("\nAudio: {}", audio.quality_label));
            }
            return out;
        }
        Err(Refusal::TooLarge { size, .. }) => {
            out.push_str(&format!(
                "This video is too large for Telegram bots.\nEstimated size: {}\nLimit: {limit_text}\n",
                fmt_bytes(Some(*size))
            ));
        }
        Err(_) => {
            out.push_str(&format!(
                "I can't reliably determine the final video size before downloading.\n\
                 Telegram bot upload limit is {limit_text}.\n\
                 Please try a shorter video.\n"
            ));
        }
    }

    match &book.audio {
        Ok(audio) => out.push_str(&format!("\nAudio option available: {}", audio.quality_label)),
        Err(reason) => out.push_str(&format!("\nAudio is not available: {reason}")),
    }
    out
}

/// A button row per offered mode.
pub fn choice_keyboard(request_id: &str, book: &PlanBook) -> Keyboard {
    book.offered_modes()
        .into_iter()
        .map(|mode| {
            let payload = Callback::Choose { mode, request_id: request_id.to_string() }.encode();
            vec![Button::new(mode.button_label(), payload)]
        })
        .collect()
}

pub fn cancel_keyboard(job_id: &str) -> Keyboard {
    vec![vec![Button::new("❌ Cancel", Callback::Cancel { job_id: job_id.to_string() }.encode())]]
}

pub fn queued(title: &str, position: usize) -> String {
    format!("{title}\n\nStatus: ⏳ Queued (#{position})")
}

pub fn cancelled(title: &str) -> String {
    format!("{title}\n\nStatus: ⛔ Cancelled")
}

pub fn failed(title: &str, reason: &str) -> String {
    format!("{title}\n\nStatus: ❌ {reason}")
}

pub fn request_log(username: Option<&str>, user_id: i64, private: bool, chat_title: Option<&str>, url: &str) -> String {
    let who = username.map(|u| format!("@{u}")).unwrap_or_else(|| "unknown".to_string());
    let chat = if private {
        "Private chat".to_string()
    } else {
        format!("Group: {}", chat_title.unwrap_or("?"))
    };
    format!("Download request from {who} ({user_id})\n\n{chat}\n\n{url}")
}
