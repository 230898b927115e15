//! Recording doubles for the collaborator traits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mediaplan::{MediaMetadata, SizeProbe};
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::cancel::JobCancel;
use crate::config::AppConfig;
use crate::errors::{ExtractError, TransportError};
use crate::extractor::{DownloadProgress, DownloadRequest, MediaExtractor, ProgressSink};
use crate::state::{AppState, SharedState};
use crate::transport::{ChatTransport, Keyboard, OutgoingFile, UploadProgress};
use crate::types::{ChatId, MessageRef};

pub const MB: u64 = 1024 * 1024;
pub const CHAT: ChatId = 42;
pub const OWNER: i64 = 7;

pub fn meta(value: Value) -> MediaMetadata {
    MediaMetadata::from_json(value.to_string().as_bytes()).unwrap()
}

/// One progressive MP4 with the given size evidence.
pub fn progressive(filesize: Option<u64>, duration: Option<u64>) -> MediaMetadata {
    meta(json!({
        "title": "Clip #shorts",
        "duration": duration,
        "formats": [{
            "format_id": "18",
            "ext": "mp4",
            "vcodec": "avc1",
            "acodec": "mp4a",
            "height": 360,
            "filesize": filesize,
            "url": "https://cdn.test/v.mp4",
        }],
    }))
}

pub fn adaptive_pair(video: u64, audio: u64) -> MediaMetadata {
    meta(json!({
        "title": "Clip",
        "duration": 120,
        "formats": [
            { "format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "height": 1080, "filesize": video },
            { "format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a", "abr": 128, "filesize": audio },
        ],
    }))
}

pub struct FakeExtractor {
    pub meta: Option<MediaMetadata>,
    pub chunk: usize,
    pub chunks: usize,
    pub chunk_delay: Duration,
    pub downloads: Mutex<Vec<DownloadRequest>>,
    pub merges: AtomicUsize,
    pub transcodes: AtomicUsize,
    pub started: Notify,
    pub running: AtomicUsize,
    pub peak_running: AtomicUsize,
}

impl FakeExtractor {
    pub fn new(meta: MediaMetadata) -> Self {
        Self {
            meta: Some(meta),
            chunk: 4096,
            chunks: 4,
            chunk_delay: Duration::from_millis(100),
            downloads: Mutex::new(Vec::new()),
            merges: AtomicUsize::new(0),
            transcodes: AtomicUsize::new(0),
            started: Notify::new(),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self { meta: None, ..Self::new(progressive(None, None)) }
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }

    async fn write_chunks(
        &self,
        path: &Path,
        progress: ProgressSink<'_>,
        cancel: &JobCancel,
    ) -> Result<(), ExtractError> {
        let total = (self.chunk * self.chunks) as u64;
        let mut data = Vec::with_capacity(total as usize);
        for _ in 0..self.chunks {
            if cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            tokio::time::sleep(self.chunk_delay).await;
            data.extend(std::iter::repeat(0u8).take(self.chunk));
            tokio::fs::write(path, &data).await?;
            progress(DownloadProgress { downloaded: data.len() as u64, total: Some(total), ..Default::default() });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaExtractor for FakeExtractor {
    async fn fetch_metadata(&self, _url: &str) -> Result<MediaMetadata, ExtractError> {
        self.meta.clone().ok_or_else(|| ExtractError::Metadata("unsupported".into()))
    }

    async fn download(
        &self,
        req: &DownloadRequest,
        progress: ProgressSink<'_>,
        cancel: &JobCancel,
    ) -> Result<PathBuf, ExtractError> {
        self.downloads.lock().unwrap().push(req.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();

        let path = req.dest_dir.join(format!("{}.mp4", req.stem));
        let result = self.write_chunks(&path, progress, cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result.map(|_| path)
    }

    async fn merge(&self, video: &Path, audio: &Path, dest: &Path, cancel: &JobCancel) -> Result<(), ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }
        self.merges.fetch_add(1, Ordering::SeqCst);
        let mut out = tokio::fs::read(video).await?;
        out.extend(tokio::fs::read(audio).await?);
        tokio::fs::write(dest, out).await?;
        Ok(())
    }

    async fn transcode_to_audio(
        &self,
        src: &Path,
        _bitrate_kbps: u32,
        dest: &Path,
        cancel: &JobCancel,
    ) -> Result<(), ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }
        self.transcodes.fetch_add(1, Ordering::SeqCst);
        let src = tokio::fs::read(src).await?;
        tokio::fs::write(dest, &src[..src.len() / 2]).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub msg: MessageRef,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

#[derive(Debug, Clone)]
pub struct Edit {
    pub msg: MessageRef,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

/// Holds an upload once `after` bytes have gone out, until `resume` fires.
pub struct UploadGate {
    pub after: u64,
    pub reached: Notify,
    pub resume: Notify,
}

impl UploadGate {
    pub fn at(after: u64) -> Arc<Self> {
        Arc::new(Self { after, reached: Notify::new(), resume: Notify::new() })
    }
}

#[derive(Default)]
pub struct FakeTransport {
    next_id: AtomicI64,
    pub upload_gate: Mutex<Option<Arc<UploadGate>>>,
    pub sent: Mutex<Vec<Sent>>,
    pub edits: Mutex<Vec<Edit>>,
    pub deleted: Mutex<Vec<MessageRef>>,
    pub answers: Mutex<Vec<(String, Option<String>)>>,
    pub files: Mutex<Vec<OutgoingFile>>,
    pub bytes_sent: AtomicU64,
}

impl FakeTransport {
    pub fn last_sent(&self) -> Sent {
        self.sent.lock().unwrap().last().cloned().unwrap()
    }

    pub fn last_edit_of(&self, msg: MessageRef) -> Option<Edit> {
        self.edits.lock().unwrap().iter().rev().find(|e| e.msg == msg).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        _reply_to: Option<i64>,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, TransportError> {
        let msg = MessageRef { chat_id, message_id: 1000 + self.next_id.fetch_add(1, Ordering::SeqCst) };
        self.sent.lock().unwrap().push(Sent { msg, text: text.to_string(), keyboard: keyboard.cloned() });
        Ok(msg)
    }

    async fn edit_message(&self, msg: MessageRef, text: &str, keyboard: Option<&Keyboard>) -> Result<(), TransportError> {
        self.edits.lock().unwrap().push(Edit { msg, text: text.to_string(), keyboard: keyboard.cloned() });
        Ok(())
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<(), TransportError> {
        self.deleted.lock().unwrap().push(msg);
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), TransportError> {
        self.answers.lock().unwrap().push((callback_id.to_string(), text.map(str::to_string)));
        Ok(())
    }

    async fn send_file(
        &self,
        file: &OutgoingFile,
        progress: UploadProgress<'_>,
        cancel: &JobCancel,
    ) -> Result<MessageRef, TransportError> {
        let data = tokio::fs::read(&file.path).await?;
        let total = data.len() as u64;
        let mut sent = 0u64;
        for chunk in data.chunks(1024) {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            sent += chunk.len() as u64;
            self.bytes_sent.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            progress(sent, total);
            let gate = {
                let mut slot = self.upload_gate.lock().unwrap();
                if slot.as_ref().is_some_and(|g| sent >= g.after) {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some(gate) = gate {
                gate.reached.notify_one();
                gate.resume.notified().await;
            }
            tokio::task::yield_now().await;
        }
        self.files.lock().unwrap().push(file.clone());
        Ok(MessageRef { chat_id: file.chat_id, message_id: 9000 + self.next_id.fetch_add(1, Ordering::SeqCst) })
    }
}

#[derive(Default)]
pub struct FakeProbe {
    pub sizes: HashMap<String, u64>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn with(url: &str, size: u64) -> Self {
        Self { sizes: HashMap::from([(url.to_string(), size)]), ..Default::default() }
    }
}

#[async_trait]
impl SizeProbe for FakeProbe {
    async fn total_len(&self, url: &str) -> Option<u64> {
        self.calls.lock().unwrap().push(url.to_string());
        self.sizes.get(url).copied()
    }
}

pub struct Harness {
    pub state: SharedState,
    pub extractor: Arc<FakeExtractor>,
    pub transport: Arc<FakeTransport>,
    pub probe: Arc<FakeProbe>,
    pub output: tempfile::TempDir,
}

impl Harness {
    pub fn new(extractor: FakeExtractor, probe: FakeProbe, env: &[(&str, &str)]) -> Self {
        let output = tempfile::tempdir().unwrap();
        let out_path = output.path().to_string_lossy().into_owned();
        let mut vars: HashMap<String, String> = HashMap::from([
            ("BOT_TOKEN".to_string(), "123:test".to_string()),
            ("OUTPUT_DIR".to_string(), out_path),
        ]);
        vars.extend(env.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let config = AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();

        let extractor = Arc::new(extractor);
        let transport = Arc::new(FakeTransport::default());
        let probe = Arc::new(probe);
        let state = Arc::new(AppState::new(config, extractor.clone(), transport.clone(), probe.clone()));
        Self { state, extractor, transport, probe, output }
    }

    /// Submits a URL from the owner and returns the choice message.
    pub async fn offer(&self, url: &str) -> (crate::types::JobState, MessageRef) {
        let source = MessageRef { chat_id: CHAT, message_id: 1 };
        let before = self.transport.sent.lock().unwrap().len();
        let reached = crate::orchestrator::submit_url(&self.state, url.to_string(), OWNER, source).await;
        let status = self.transport.sent.lock().unwrap()[before].msg;
        (reached, status)
    }

    /// Request id carried by the first choice button shown on `msg`.
    pub fn request_id_on(&self, msg: MessageRef) -> String {
        let edit = self.transport.last_edit_of(msg).unwrap();
        let payload = &edit.keyboard.unwrap()[0][0].payload;
        payload.rsplit('|').next().unwrap().to_string()
    }

    pub fn leftover_entries(&self) -> usize {
        std::fs::read_dir(self.output.path()).unwrap().count()
    }

    /// Waits until every admitted job has reached a terminal state.
    pub async fn settle(&self) {
        for _ in 0..10_000 {
            let idle = self.state.jobs.read().await.is_empty()
                && self.state.pool.queued() == 0
                && self.state.pool.active() == 0;
            if idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("jobs did not settle");
    }
}
