use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use mediaplan::MediaMetadata;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cancel::JobCancel;
use crate::errors::ExtractError;
use crate::extractor::{DownloadProgress, DownloadRequest, MediaExtractor, ProgressSink};

const PROGRESS_PREFIX: &str = "PROGRESS";
const PROGRESS_TEMPLATE: &str = "download:PROGRESS %(progress.downloaded_bytes)s %(progress.total_bytes)s \
%(progress.total_bytes_estimate)s %(progress.fragment_index)s %(progress.fragment_count)s";
const STDERR_TAIL_LINES: usize = 8;

/// yt-dlp for extraction and download, ffmpeg for merge and transcode.
pub struct YtDlpExtractor {
    ytdlp_bin: String,
    ffmpeg_bin: String,
    concurrent_fragments: u32,
}

impl YtDlpExtractor {
    pub fn new(ytdlp_bin: impl Into<String>, ffmpeg_bin: impl Into<String>, concurrent_fragments: u32) -> Self {
        Self {
            ytdlp_bin: ytdlp_bin.into(),
            ffmpeg_bin: ffmpeg_bin.into(),
            concurrent_fragments,
        }
    }

    fn ffmpeg(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(["-y", "-hide_banner", "-nostdin", "-loglevel", "error"]);
        cmd
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn fetch_metadata(&self, url: &str) -> Result<MediaMetadata, ExtractError> {
        let out = Command::new(&self.ytdlp_bin)
            .args(["-J", "--no-playlist", "--no-warnings", "--", url])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExtractError::Spawn { tool: self.ytdlp_bin.clone(), source })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ExtractError::Tool {
                tool: self.ytdlp_bin.clone(),
                status: out.status.to_string(),
                detail: tail(stderr.lines()),
            });
        }
        MediaMetadata::from_json(&out.stdout).map_err(|e| ExtractError::Metadata(e.to_string()))
    }

    async fn download(
        &self,
        req: &DownloadRequest,
        progress: ProgressSink<'_>,
        cancel: &JobCancel,
    ) -> Result<PathBuf, ExtractError> {
        let mut cmd = Command::new(&self.ytdlp_bin);
        cmd.args(download_args(req, self.concurrent_fragments));
        info!(url = %req.url, format = %req.format, stem = %req.stem, "yt-dlp download");

        let limit = req.max_bytes;
        let mut on_line = |line: &str| -> Result<(), ExtractError> {
            let Some(p) = parse_progress_line(line) else {
                return Ok(());
            };
            if let (Some(limit), Some(total)) = (limit, p.total) {
                if total > limit {
                    return Err(ExtractError::TooLarge { size: total, limit });
                }
            }
            progress(p);
            Ok(())
        };
        run_tool(&self.ytdlp_bin, cmd, cancel, &mut on_line).await?;

        find_output(&req.dest_dir, &req.stem).await
    }

    async fn merge(&self, video: &Path, audio: &Path, dest: &Path, cancel: &JobCancel) -> Result<(), ExtractError> {
        let mut cmd = self.ffmpeg();
        cmd.arg("-i")
            .arg(video)
            .arg("-i")
            .arg(audio)
            .args(["-map", "0:v:0", "-map", "1:a:0", "-c", "copy", "-movflags", "+faststart"])
            .arg(dest);
        run_tool(&self.ffmpeg_bin, cmd, cancel, &mut |_: &str| Ok(())).await?;
        ensure_exists(dest).await
    }

    async fn transcode_to_audio(
        &self,
        src: &Path,
        bitrate_kbps: u32,
        dest: &Path,
        cancel: &JobCancel,
    ) -> Result<(), ExtractError> {
        let mut cmd = self.ffmpeg();
        cmd.arg("-i")
            .arg(src)
            .args(["-vn", "-codec:a", "libmp3lame", "-b:a"])
            .arg(format!("{bitrate_kbps}k"))
            .arg(dest);
        run_tool(&self.ffmpeg_bin, cmd, cancel, &mut |_: &str| Ok(())).await?;
        ensure_exists(dest).await
    }
}

fn download_args(req: &DownloadRequest, concurrent_fragments: u32) -> Vec<String> {
    let template = req.dest_dir.join(format!("{}.%(ext)s", req.stem));
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--no-part".to_string(),
        "-f".to_string(),
        req.format.clone(),
        "-o".to_string(),
        template.to_string_lossy().into_owned(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
        "--concurrent-fragments".to_string(),
        concurrent_fragments.to_string(),
        "--retries".to_string(),
        "5".to_string(),
        "--fragment-retries".to_string(),
        "5".to_string(),
        "--socket-timeout".to_string(),
        "20".to_string(),
    ];
    if let Some(max) = req.max_bytes {
        args.push("--max-filesize".to_string());
        args.push(max.to_string());
    }
    args.push("--".to_string());
    args.push(req.url.clone());
    args
}

/// Parses one line printed through [`PROGRESS_TEMPLATE`]. Missing fields are `NA`.
fn parse_progress_line(line: &str) -> Option<DownloadProgress> {
    let mut parts = line.split_whitespace();
    if parts.next()? != PROGRESS_PREFIX {
        return None;
    }
    let mut field = || parts.next().and_then(parse_count);
    Some(DownloadProgress {
        downloaded: field().unwrap_or(0),
        total: field(),
        total_estimate: field(),
        fragment_index: field(),
        fragment_count: field(),
    })
}

fn parse_count(s: &str) -> Option<u64> {
    if s == "NA" || s == "None" {
        return None;
    }
    s.parse::<u64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64))
}

/// Runs a tool to completion, feeding stdout lines to `on_line`.
/// The child is killed on cancel or when `on_line` fails.
async fn run_tool(
    tool: &str,
    mut cmd: Command,
    cancel: &JobCancel,
    on_line: &mut (dyn FnMut(&str) -> Result<(), ExtractError> + Send),
) -> Result<(), ExtractError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|source| ExtractError::Spawn { tool: tool.to_string(), source })?;

    let stderr_tail = child.stderr.take().map(|s| tokio::spawn(collect_tail(s)));
    let mut lines = child.stdout.take().map(|s| BufReader::new(s).lines());

    let outcome: Result<(), ExtractError> = async {
        if let Some(lines) = lines.as_mut() {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
                    next = lines.next_line() => match next? {
                        Some(line) => on_line(&line)?,
                        None => break,
                    },
                }
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = outcome {
        if let Err(kill_err) = child.kill().await {
            warn!(%tool, "kill failed: {kill_err}");
        }
        return Err(e);
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(ExtractError::Cancelled);
        }
        status = child.wait() => status?,
    };

    if status.success() {
        debug!(%tool, "tool finished");
        return Ok(());
    }

    let detail = match stderr_tail {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    Err(ExtractError::Tool { tool: tool.to_string(), status: status.to_string(), detail })
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut kept: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if kept.len() == STDERR_TAIL_LINES {
            kept.pop_front();
        }
        kept.push_back(line);
    }
    kept.into_iter().collect::<Vec<_>>().join("\n")
}

fn tail<'a>(lines: impl Iterator<Item = &'a str>) -> String {
    let all: Vec<&str> = lines.collect();
    let start = all.len().saturating_sub(STDERR_TAIL_LINES);
    all[start..].join("\n")
}

async fn find_output(dir: &Path, stem: &str) -> Result<PathBuf, ExtractError> {
    let prefix = format!("{stem}.");
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && !name.ends_with(".part") && !name.ends_with(".ytdl") {
            return Ok(entry.path());
        }
    }
    Err(ExtractError::OutputMissing(dir.to_path_buf()))
}

async fn ensure_exists(path: &Path) -> Result<(), ExtractError> {
    if tokio::fs::try_exists(path).await? {
        Ok(())
    } else {
        Err(ExtractError::OutputMissing(path.to_path_buf()))
    }
}
