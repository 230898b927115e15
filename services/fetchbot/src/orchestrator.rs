use choicestore::StoreError;
use mediaplan::{display_title, extract_first_url, is_valid_youtube_url, is_youtube_host, DeliveryMode, PlanSelector};
use tracing::{debug, info, warn};

use crate::cancel::JobCancel;
use crate::errors::LifecycleError;
use crate::render;
use crate::state::SharedState;
use crate::transport::{answer_quietly, edit_quietly, send_quietly, Keyboard};
use crate::types::{new_job_id, ActiveJob, Callback, Inbound, Job, JobState, Lifecycle, MessageRef, PendingRequest, Sender, UserId};

/// Result of pressing a choice button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChoiceOutcome {
    Queued { job_id: String, position: usize },
    Expired,
    Gone,
    Busy,
    NotYours,
    NotOffered,
    QueueFull,
}

impl ChoiceOutcome {
    fn ack_text(&self) -> &'static str {
        match self {
            ChoiceOutcome::Queued { .. } => render::ACCEPTED,
            ChoiceOutcome::Expired => render::EXPIRED,
            ChoiceOutcome::Gone => render::GONE,
            ChoiceOutcome::Busy => render::ALREADY_CLAIMED,
            ChoiceOutcome::NotYours => render::NOT_YOURS,
            ChoiceOutcome::NotOffered => render::NOT_OFFERED,
            ChoiceOutcome::QueueFull => render::QUEUE_FULL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    NotYours,
    NothingToCancel,
}

pub async fn handle_inbound(state: SharedState, event: Inbound) {
    match event {
        Inbound::Text { message, from, private, chat_title, text } => {
            on_text(&state, message, &from, private, chat_title.as_deref(), &text).await
        }
        Inbound::Callback { id, from, message, data } => on_callback(&state, &id, &from, message, &data).await,
    }
}

async fn on_text(
    state: &SharedState,
    message: MessageRef,
    from: &Sender,
    private: bool,
    chat_title: Option<&str>,
    text: &str,
) {
    if !private {
        debug!(chat_id = message.chat_id, "ignoring non-private chat");
        return;
    }
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    let transport = state.transport.as_ref();
    let reply_to = Some(message.message_id);

    if text.starts_with('/') {
        let command = text.split_whitespace().next().unwrap_or_default();
        let command = command.split('@').next().unwrap_or_default();
        if matches!(command, "/start" | "/help") {
            let help = render::help(state.config.max_send_bytes);
            send_quietly(transport, message.chat_id, &help, reply_to, None).await;
        }
        return;
    }

    let Some(url) = extract_first_url(text).filter(|u| is_acceptable_url(u)) else {
        send_quietly(transport, message.chat_id, render::INVALID_URL, reply_to, None).await;
        return;
    };

    if let Some(log_chat) = state.config.log_chat_id {
        let line = render::request_log(from.username.as_deref(), from.id, private, chat_title, &url);
        send_quietly(transport, log_chat, &line, None, None).await;
    }

    submit_url(state, url, from.id, message).await;
}

fn is_acceptable_url(raw: &str) -> bool {
    let Ok(parsed) = url::Url::parse(raw) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    match parsed.host_str() {
        Some(host) if is_youtube_host(host) => is_valid_youtube_url(raw),
        Some(_) => true,
        None => false,
    }
}

/// Takes a URL from `Created` to `AwaitingChoice`, or to `Refused`/`Failed`
/// without anything being queued. Returns the state reached.
pub async fn submit_url(state: &SharedState, url: String, owner: UserId, source: MessageRef) -> JobState {
    let mut life = Lifecycle::new(format!("{}:{}", source.chat_id, source.message_id));
    let transport = state.transport.as_ref();
    let status = send_quietly(transport, source.chat_id, render::GETTING_INFO, Some(source.message_id), None).await;
    let show = move |text: String, keyboard: Option<Keyboard>| async move {
        match status {
            Some(msg) => edit_quietly(transport, msg, &text, keyboard.as_ref()).await,
            None => {
                send_quietly(transport, source.chat_id, &text, Some(source.message_id), keyboard.as_ref()).await;
            }
        }
    };

    let meta = match state.extractor.fetch_metadata(&url).await {
        Ok(meta) => meta,
        Err(e) => {
            let err = LifecycleError::MetadataFetch(e.to_string());
            warn!(%url, "{err}");
            advance_logged(&mut life, JobState::Failed);
            show(render::UNSUPPORTED_URL.to_string(), None).await;
            return life.state();
        }
    };
    advance_logged(&mut life, JobState::MetadataFetched);

    let title = display_title(meta.title.as_deref());
    let ceiling = state.config.max_send_bytes;
    let selector = PlanSelector::new(state.probe.as_ref(), state.config.plan_policy());
    let plans = selector.build_plans(&meta).await;
    let offer_text = render::offer(&title, &plans, ceiling);

    if plans.is_refused() {
        if let Err(reason) = &plans.video {
            info!(%url, "{}", LifecycleError::SizeUnprovable(*reason));
        }
        advance_logged(&mut life, JobState::Refused);
        show(offer_text, None).await;
        return life.state();
    }
    advance_logged(&mut life, JobState::PlansReady);

    let keyboard_plans = plans.clone();
    let request_id = state
        .store
        .put(PendingRequest { url, title, owner, source, plans, offer_text: offer_text.clone() })
        .await;
    life.rekey(request_id.clone());
    show(offer_text, Some(render::choice_keyboard(&request_id, &keyboard_plans))).await;
    advance_logged(&mut life, JobState::AwaitingChoice);
    life.state()
}

async fn on_callback(state: &SharedState, callback_id: &str, from: &Sender, message: Option<MessageRef>, data: &str) {
    let transport = state.transport.as_ref();
    match Callback::parse(data) {
        Some(Callback::Choose { mode, request_id }) => {
            let outcome = on_choice(state, &request_id, mode, from.id, message).await;
            answer_quietly(transport, callback_id, Some(outcome.ack_text())).await;
        }
        Some(Callback::Cancel { job_id }) => {
            let text = match on_cancel(state, &job_id, from.id).await {
                CancelOutcome::Requested => render::CANCELLED_ACK,
                CancelOutcome::NotYours => render::NOT_YOURS,
                CancelOutcome::NothingToCancel => render::NOTHING_TO_CANCEL,
            };
            answer_quietly(transport, callback_id, Some(text)).await;
        }
        None => {
            debug!(data, "unrecognised callback payload");
            answer_quietly(transport, callback_id, Some(render::INVALID_ACTION)).await;
        }
    }
}

/// `AwaitingChoice -> Queued` for the request owner, exactly once per request.
pub async fn on_choice(
    state: &SharedState,
    request_id: &str,
    mode: DeliveryMode,
    user: UserId,
    message: Option<MessageRef>,
) -> ChoiceOutcome {
    let transport = state.transport.as_ref();
    let entry = match state.store.claim(request_id).await {
        Ok(entry) => entry,
        Err(StoreError::Expired) => {
            info!(request_id, "{}", LifecycleError::ExpiredChoice);
            let mut life = Lifecycle::resume(request_id, JobState::AwaitingChoice);
            advance_logged(&mut life, JobState::Expired);
            if let Some(msg) = message {
                edit_quietly(transport, msg, render::EXPIRED, None).await;
            }
            return ChoiceOutcome::Expired;
        }
        Err(StoreError::Missing) => return ChoiceOutcome::Gone,
        Err(StoreError::Claimed) => return ChoiceOutcome::Busy,
    };
    let request = entry.value;

    if request.owner != user {
        state.store.release(request_id).await;
        return ChoiceOutcome::NotYours;
    }
    let Some(plan) = request.plans.plan_for(mode).cloned() else {
        state.store.release(request_id).await;
        return ChoiceOutcome::NotOffered;
    };

    let job_id = new_job_id();
    let cancel = JobCancel::new();
    let queued_text = render::queued(&request.title, state.pool.queued() + 1);
    let cancel_kb = render::cancel_keyboard(&job_id);

    // the status message shows the queue before any worker can edit it
    let status = match message {
        Some(msg) => {
            edit_quietly(transport, msg, &queued_text, Some(&cancel_kb)).await;
            msg
        }
        None => {
            let sent = send_quietly(
                transport,
                request.source.chat_id,
                &queued_text,
                Some(request.source.message_id),
                Some(&cancel_kb),
            )
            .await;
            match sent {
                Some(msg) => msg,
                None => {
                    state.store.release(request_id).await;
                    return ChoiceOutcome::Gone;
                }
            }
        }
    };

    state
        .set_job(
            &job_id,
            ActiveJob { owner: user, status, title: request.title.clone(), cancel: cancel.clone() },
        )
        .await;

    let job = Job {
        id: job_id.clone(),
        request_id: request_id.to_string(),
        url: request.url.clone(),
        title: request.title.clone(),
        mode,
        plan,
        owner: user,
        source: request.source,
        status,
        cancel,
        admitted_at: chrono::Utc::now(),
    };

    match state.pool.try_enqueue(job) {
        Ok(position) => {
            let mut life = Lifecycle::resume(request_id, JobState::AwaitingChoice);
            advance_logged(&mut life, JobState::Queued);
            state.store.remove(request_id).await;
            info!(request_id, job_id = %job_id, position, mode = ?mode, "job admitted");
            ChoiceOutcome::Queued { job_id, position }
        }
        Err(e) => {
            warn!(request_id, "{e}");
            state.drop_job(&job_id).await;
            state.store.release(request_id).await;
            let keyboard = render::choice_keyboard(request_id, &request.plans);
            edit_quietly(transport, status, &request.offer_text, Some(&keyboard)).await;
            ChoiceOutcome::QueueFull
        }
    }
}

/// Flags the job; the worker notices at its next checkpoint.
pub async fn on_cancel(state: &SharedState, job_id: &str, user: UserId) -> CancelOutcome {
    let Some(job) = state.get_job(job_id).await else {
        return CancelOutcome::NothingToCancel;
    };
    if job.owner != user {
        return CancelOutcome::NotYours;
    }
    job.cancel.request_cancel();
    info!(job_id, "cancel requested");
    edit_quietly(state.transport.as_ref(), job.status, &render::cancelled(&job.title), None).await;
    CancelOutcome::Requested
}

fn advance_logged(life: &mut Lifecycle, next: JobState) {
    if let Err(e) = life.advance(next) {
        warn!("{e}");
    }
}

/// Periodically turns overdue choices into tombstones and forgets old ones.
pub async fn run_store_sweeper(state: SharedState) {
    let mut tick = tokio::time::interval(state.config.sweep_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let stats = state.store.sweep().await;
        if stats.expired > 0 || stats.forgotten > 0 {
            info!(expired = stats.expired, forgotten = stats.forgotten, "store sweep");
        }
    }
}
