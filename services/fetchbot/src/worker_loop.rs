use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mediaplan::{fmt_bytes, sanitize_filename_base, DeliveryMode, FormatSelection};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::errors::{LifecycleError, TransferStage};
use crate::extractor::{DownloadProgress, DownloadRequest};
use crate::progress::{Phase, ProgressReporter, ProgressState};
use crate::render;
use crate::state::{AppState, SharedState};
use crate::transport::{delete_quietly, edit_quietly, ChatTransport, Keyboard, OutgoingFile};
use crate::types::{Job, JobState, Lifecycle, MessageRef};

/// Bounded FIFO of admitted jobs plus the counters the workers share.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    queued: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    /// Never waits. Returns the job's position in the queue, counting itself.
    pub fn try_enqueue(&self, job: Job) -> Result<usize, LifecycleError> {
        let position = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
        match self.tx.try_send(job) {
            Ok(()) => Ok(position),
            Err(_) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Err(LifecycleError::QueueFull)
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of jobs that were ever running at once.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    async fn next_job(&self) -> Option<Job> {
        let job = self.rx.lock().await.recv().await;
        if job.is_some() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        job
    }

    fn enter(&self) -> ActiveSlot<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        ActiveSlot { pool: self }
    }
}

struct ActiveSlot<'a> {
    pool: &'a WorkerPool,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn spawn_workers(state: &SharedState) -> Vec<JoinHandle<()>> {
    (0..state.config.workers)
        .map(|worker| {
            let st = state.clone();
            tokio::spawn(run_worker_loop(st, worker))
        })
        .collect()
}

pub async fn run_worker_loop(state: SharedState, worker: usize) {
    info!(worker, "worker_loop: started");
    while let Some(job) = state.pool.next_job().await {
        let _slot = state.pool.enter();
        run_job(&state, job).await;
    }
    info!(worker, "worker_loop: queue closed");
}

async fn run_job(state: &AppState, job: Job) {
    let waited_ms = (chrono::Utc::now() - job.admitted_at).num_milliseconds();
    info!(job_id = %job.id, request_id = %job.request_id, mode = ?job.mode, waited_ms, "worker: starting job");
    let mut life = Lifecycle::resume(job.id.clone(), JobState::Queued);

    let outcome = execute_job(state, &job, &mut life).await;
    let transport = state.transport.as_ref();

    match outcome {
        Ok(()) => {
            advance_logged(&mut life, JobState::Delivered);
            delete_quietly(transport, job.status).await;
        }
        Err(e) if e.is_cancelled() || job.cancel.is_cancelled() => {
            advance_logged(&mut life, JobState::Cancelled);
            edit_quietly(transport, job.status, &render::cancelled(&job.title), None).await;
        }
        Err(e) => {
            error!(job_id = %job.id, "job failed: {e}");
            advance_logged(&mut life, JobState::Failed);
            edit_quietly(transport, job.status, &render::failed(&job.title, &failure_reason(&e)), None).await;
        }
    }

    state.drop_job(&job.id).await;
}

fn advance_logged(life: &mut Lifecycle, next: JobState) {
    if let Err(e) = life.advance(next) {
        warn!("{e}");
    }
}

fn failure_reason(err: &LifecycleError) -> String {
    match err {
        LifecycleError::Transfer { stage: TransferStage::Download, message } => format!("Download failed: {message}"),
        LifecycleError::Transfer { stage: TransferStage::Upload, message } => format!("Upload failed: {message}"),
        LifecycleError::Transfer { stage, message } => format!("Processing failed ({stage}): {message}"),
        other => format!("Failed: {other}"),
    }
}

/// Runs one claimed job inside its own scratch directory, which is gone
/// when this returns.
async fn execute_job(state: &AppState, job: &Job, life: &mut Lifecycle) -> Result<(), LifecycleError> {
    // a job cancelled while queued never downloads
    job.cancel.checkpoint()?;
    life.advance(JobState::Downloading)?;

    let workspace = tempfile::Builder::new()
        .prefix(&format!("{}-", job.id))
        .tempdir_in(&state.config.output_dir)
        .map_err(|e| LifecycleError::transfer(TransferStage::Download, e))?;

    let (progress_tx, progress_rx) = watch::channel(ProgressState::new(Phase::Downloading, job.plan.size.bytes()));
    let pump = tokio::spawn(pump_status(
        state.transport.clone(),
        job.status,
        job.title.clone(),
        render::cancel_keyboard(&job.id),
        progress_rx,
        state.config.edit_interval,
    ));

    let result = transfer(state, job, life, workspace.path(), &progress_tx).await;

    drop(progress_tx);
    if let Err(e) = pump.await {
        warn!(job_id = %job.id, "status pump ended abnormally: {e}");
    }
    let dir = workspace.path().to_path_buf();
    if let Err(e) = workspace.close() {
        warn!(job_id = %job.id, dir = %dir.display(), "workspace cleanup failed: {e}");
    }
    result
}

async fn transfer(
    state: &AppState,
    job: &Job,
    life: &mut Lifecycle,
    dir: &Path,
    progress: &watch::Sender<ProgressState>,
) -> Result<(), LifecycleError> {
    let extractor = state.extractor.as_ref();
    let ceiling = state.config.max_send_bytes;
    // audio sources may be larger than the ceiling; the transcode shrinks them
    let source_limit = match job.mode {
        DeliveryMode::Audio => None,
        DeliveryMode::Video | DeliveryMode::Document => Some(ceiling),
    };

    let produced: PathBuf = match &job.plan.selection {
        FormatSelection::Single { format_id } => {
            let leg = Leg { stem: "media", format: format_id.clone(), limit: source_limit, offset: None };
            let path = download_leg(state, job, dir, leg, progress).await?;
            progress.send_modify(ProgressState::finish);
            path
        }
        FormatSelection::Merged { video_id, audio_id } => {
            let whole = job.plan.size.bytes().unwrap_or(0);
            let video = download_leg(
                state,
                job,
                dir,
                Leg { stem: "video", format: video_id.clone(), limit: source_limit, offset: Some((0, whole)) },
                progress,
            )
            .await?;
            let video_len = file_len(&video).await?;
            let audio = download_leg(
                state,
                job,
                dir,
                Leg { stem: "audio", format: audio_id.clone(), limit: source_limit, offset: Some((video_len, whole)) },
                progress,
            )
            .await?;

            job.cancel.checkpoint()?;
            life.advance(JobState::Transcoding)?;
            progress.send_replace(ProgressState::new(Phase::Transcoding, None));
            let out = dir.join(format!("merged.{}", job.plan.container));
            extractor
                .merge(&video, &audio, &out, &job.cancel)
                .await
                .map_err(|e| e.at(TransferStage::Merge))?;
            out
        }
        FormatSelection::BestAudio => {
            let leg = Leg { stem: "source", format: job.plan.selection.spec(), limit: None, offset: None };
            let source = download_leg(state, job, dir, leg, progress).await?;

            job.cancel.checkpoint()?;
            life.advance(JobState::Transcoding)?;
            progress.send_replace(ProgressState::new(Phase::Transcoding, None));
            let kbps = job.plan.audio_bitrate_kbps.unwrap_or(128);
            let out = dir.join("audio.mp3");
            extractor
                .transcode_to_audio(&source, kbps, &out, &job.cancel)
                .await
                .map_err(|e| e.at(TransferStage::Transcode))?;
            out
        }
    };

    job.cancel.checkpoint()?;
    let size = file_len(&produced).await?;
    if size > ceiling {
        return Err(LifecycleError::transfer(
            TransferStage::Upload,
            format!("the file is {}, which exceeds the limit {}", fmt_bytes(Some(size)), fmt_bytes(Some(ceiling))),
        ));
    }

    life.advance(JobState::Uploading)?;
    progress.send_replace(ProgressState::new(Phase::Uploading, Some(size)));

    let file = OutgoingFile {
        chat_id: job.source.chat_id,
        file_name: delivery_file_name(&job.title, &produced, job.mode),
        path: produced,
        send_as: job.mode.into(),
        reply_to: Some(job.source.message_id),
    };
    let on_sent = |sent: u64, total: u64| {
        progress.send_modify(|p| p.observe(sent, Some(total), None));
    };
    state
        .transport
        .send_file(&file, &on_sent, &job.cancel)
        .await
        .map_err(|e| e.at(TransferStage::Upload))?;
    info!(job_id = %job.id, bytes = size, "delivered");
    Ok(())
}

struct Leg {
    stem: &'static str,
    format: String,
    limit: Option<u64>,
    /// For one leg of a merged pair: bytes already fetched and the pair total.
    offset: Option<(u64, u64)>,
}

async fn download_leg(
    state: &AppState,
    job: &Job,
    dir: &Path,
    leg: Leg,
    progress: &watch::Sender<ProgressState>,
) -> Result<PathBuf, LifecycleError> {
    job.cancel.checkpoint()?;
    let req = DownloadRequest {
        url: job.url.clone(),
        format: leg.format,
        dest_dir: dir.to_path_buf(),
        stem: leg.stem.to_string(),
        max_bytes: leg.limit,
    };
    let offset = leg.offset;
    let on_progress = |p: DownloadProgress| {
        progress.send_modify(|s| match offset {
            Some((done, whole)) if whole > 0 => s.observe(done + p.downloaded, Some(whole), None),
            _ => s.observe(p.downloaded, p.expected(), p.fragments()),
        });
    };
    state
        .extractor
        .download(&req, &on_progress, &job.cancel)
        .await
        .map_err(|e| e.at(TransferStage::Download))
}

async fn file_len(path: &Path) -> Result<u64, LifecycleError> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| LifecycleError::transfer(TransferStage::Download, e))
}

fn delivery_file_name(title: &str, produced: &Path, mode: DeliveryMode) -> String {
    let base = sanitize_filename_base(title);
    let ext = match mode {
        DeliveryMode::Audio => "mp3".to_string(),
        DeliveryMode::Video | DeliveryMode::Document => produced
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or("mp4")
            .to_string(),
    };
    format!("{base}.{ext}")
}

/// Edits the status message from the job's progress channel until the
/// sender goes away.
async fn pump_status(
    transport: Arc<dyn ChatTransport>,
    status: MessageRef,
    title: String,
    keyboard: Keyboard,
    mut rx: watch::Receiver<ProgressState>,
    interval: Duration,
) {
    let mut reporter = ProgressReporter::new(title, interval);
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(text) = reporter.maybe_emit(&current) {
            edit_quietly(transport.as_ref(), status, &text, Some(&keyboard)).await;
        }
        tokio::select! {
            changed = rx.changed() => if changed.is_err() { break },
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Workspace dirs are `<job id>-<random suffix>`, see `execute_job`.
fn is_workspace_name(name: &str) -> bool {
    match name.split_once('-') {
        Some((id, suffix)) => {
            id.len() == 12 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) && !suffix.is_empty()
        }
        None => false,
    }
}

/// Removes scratch directories left behind by a previous run. Anything else
/// under the output dir is left alone.
pub async fn purge_stale_workspaces(output_dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if !entry.file_name().to_str().is_some_and(is_workspace_name) {
            continue;
        }
        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(dir = %entry.path().display(), "stale workspace not removed: {e}"),
        }
    }
    if removed > 0 {
        info!(removed, "purged stale workspaces");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::orchestrator::{on_cancel, on_choice, CancelOutcome, ChoiceOutcome};
    use crate::testkit::*;
    use crate::transport::SendAs;

    async fn admit(h: &Harness, url: &str, mode: DeliveryMode) -> (String, MessageRef) {
        let (_, status) = h.offer(url).await;
        let request_id = h.request_id_on(status);
        match on_choice(&h.state, &request_id, mode, OWNER, Some(status)).await {
            ChoiceOutcome::Queued { job_id, .. } => (job_id, status),
            other => panic!("not admitted: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_runs_more_jobs_than_workers() {
        let h = Harness::new(
            FakeExtractor::new(progressive(Some(10 * MB), None)),
            FakeProbe::default(),
            &[("WORKERS", "2")],
        );
        for n in 0..6 {
            admit(&h, &format!("https://site.test/watch/{n}"), DeliveryMode::Document).await;
        }
        assert_eq!(h.state.pool.queued(), 6);

        spawn_workers(&h.state);
        h.settle().await;

        assert_eq!(h.transport.file_count(), 6);
        assert!(h.state.pool.peak_active() <= 2);
        assert!(h.extractor.peak_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(h.extractor.peak_running.load(Ordering::SeqCst), 2);
        assert_eq!(h.leftover_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_download_sends_nothing_and_cleans_up() {
        let mut extractor = FakeExtractor::new(progressive(Some(10 * MB), None));
        extractor.chunks = 20;
        extractor.chunk_delay = Duration::from_secs(1);
        let h = Harness::new(extractor, FakeProbe::default(), &[]);
        let (job_id, status) = admit(&h, "https://site.test/watch/1", DeliveryMode::Video).await;

        spawn_workers(&h.state);
        h.extractor.started.notified().await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(h.leftover_entries(), 1);

        assert_eq!(on_cancel(&h.state, &job_id, OWNER).await, CancelOutcome::Requested);
        h.settle().await;

        assert_eq!(h.transport.file_count(), 0);
        assert_eq!(h.transport.bytes_sent.load(Ordering::SeqCst), 0);
        assert_eq!(h.leftover_entries(), 0);
        assert!(h.transport.last_edit_of(status).unwrap().text.ends_with("⛔ Cancelled"));
        assert!(h.transport.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_upload_stops_sending_and_cleans_up() {
        let h = Harness::new(FakeExtractor::new(progressive(Some(10 * MB), None)), FakeProbe::default(), &[]);
        let gate = UploadGate::at(4096);
        *h.transport.upload_gate.lock().unwrap() = Some(gate.clone());
        let (job_id, status) = admit(&h, "https://site.test/watch/1", DeliveryMode::Video).await;

        spawn_workers(&h.state);
        gate.reached.notified().await;
        assert_eq!(on_cancel(&h.state, &job_id, OWNER).await, CancelOutcome::Requested);
        gate.resume.notify_one();
        h.settle().await;

        let produced = (h.extractor.chunk * h.extractor.chunks) as u64;
        let sent = h.transport.bytes_sent.load(Ordering::SeqCst);
        assert_eq!(sent, 4096);
        assert!(sent < produced);
        assert_eq!(h.transport.file_count(), 0);
        assert_eq!(h.leftover_entries(), 0);
        assert!(h.transport.last_edit_of(status).unwrap().text.ends_with("⛔ Cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn job_cancelled_while_queued_never_downloads() {
        let h = Harness::new(FakeExtractor::new(progressive(Some(10 * MB), None)), FakeProbe::default(), &[]);
        let (job_id, _) = admit(&h, "https://site.test/watch/1", DeliveryMode::Video).await;
        on_cancel(&h.state, &job_id, OWNER).await;

        spawn_workers(&h.state);
        h.settle().await;

        assert_eq!(h.extractor.download_count(), 0);
        assert_eq!(h.transport.file_count(), 0);
        assert_eq!(h.leftover_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_mode_transcodes_at_planned_bitrate() {
        let h = Harness::new(FakeExtractor::new(progressive(Some(60 * MB), Some(600))), FakeProbe::default(), &[]);
        admit(&h, "https://site.test/watch/1", DeliveryMode::Audio).await;

        spawn_workers(&h.state);
        h.settle().await;

        let downloads = h.extractor.downloads.lock().unwrap().clone();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].format, "bestaudio/best");
        assert_eq!(downloads[0].max_bytes, None);
        assert_eq!(h.extractor.transcodes.load(Ordering::SeqCst), 1);

        let files = h.transport.files.lock().unwrap().clone();
        assert_eq!(files[0].send_as, SendAs::Audio);
        assert_eq!(files[0].file_name, "Clip.mp3");
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_pair_is_merged() {
        let h = Harness::new(FakeExtractor::new(adaptive_pair(20 * MB, 2 * MB)), FakeProbe::default(), &[]);
        admit(&h, "https://site.test/watch/1", DeliveryMode::Video).await;

        spawn_workers(&h.state);
        h.settle().await;

        let formats: Vec<String> = h.extractor.downloads.lock().unwrap().iter().map(|d| d.format.clone()).collect();
        assert_eq!(formats, ["137", "140"]);
        assert_eq!(h.extractor.merges.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.file_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn produced_file_over_ceiling_fails_before_upload() {
        // metadata claims 1 KB; the download is 16 KB
        let h = Harness::new(
            FakeExtractor::new(progressive(Some(1024), None)),
            FakeProbe::default(),
            &[("MAX_SEND_BYTES", "8192")],
        );
        let (_, status) = admit(&h, "https://site.test/watch/1", DeliveryMode::Document).await;

        spawn_workers(&h.state);
        h.settle().await;

        assert_eq!(h.transport.file_count(), 0);
        let shown = h.transport.last_edit_of(status).unwrap();
        assert!(shown.text.contains("exceeds the limit"), "{}", shown.text);
        assert_eq!(h.leftover_entries(), 0);
    }

    #[tokio::test]
    async fn stale_workspaces_are_purged() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("0f3a9c21b7de-Xy12Ab");
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join("media.mp4"), b"x").unwrap();
        for foreign in ["abc-1", "photos", "0f3a9c21b7zz-Xy12Ab", "0f3a9c21b7de-"] {
            std::fs::create_dir(dir.path().join(foreign)).unwrap();
        }
        std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        assert_eq!(purge_stale_workspaces(dir.path()).await.unwrap(), 1);
        assert!(!stale.exists());
        assert!(dir.path().join("keep.txt").exists());
        assert!(dir.path().join("abc-1").exists());
        assert!(dir.path().join("photos").exists());
        assert!(dir.path().join("0f3a9c21b7zz-Xy12Ab").exists());
    }

    #[test]
    fn workspace_names_match_job_ids() {
        let id = crate::types::new_job_id();
        assert!(is_workspace_name(&format!("{id}-Ab3xYz")));
        assert!(!is_workspace_name(&id));
        assert!(!is_workspace_name("backup-2024"));
    }

    #[test]
    fn file_names_follow_mode() {
        let p = Path::new("/tmp/x/media.webm");
        assert_eq!(delivery_file_name("My #cool Clip: part 1", p, DeliveryMode::Document), "My Clip part 1.webm");
        assert_eq!(delivery_file_name("", p, DeliveryMode::Audio), "video.mp3");
    }

    #[test]
    fn queue_rejects_when_full() {
        let pool = WorkerPool::new(1);
        let job = |id: &str| Job {
            id: id.into(),
            request_id: "r".into(),
            url: "u".into(),
            title: "t".into(),
            mode: DeliveryMode::Video,
            plan: mediaplan::plan_audio(Some(10), &mediaplan::PlanPolicy::new(50 * MB)).unwrap(),
            owner: OWNER,
            source: MessageRef { chat_id: CHAT, message_id: 1 },
            status: MessageRef { chat_id: CHAT, message_id: 2 },
            cancel: crate::cancel::JobCancel::new(),
            admitted_at: chrono::Utc::now(),
        };
        assert_eq!(pool.try_enqueue(job("a")).unwrap(), 1);
        assert!(matches!(pool.try_enqueue(job("b")), Err(LifecycleError::QueueFull)));
        assert_eq!(pool.queued(), 1);
    }
}
