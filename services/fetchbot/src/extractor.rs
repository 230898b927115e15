use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mediaplan::MediaMetadata;

use crate::cancel::JobCancel;
use crate::errors::ExtractError;

/// One progress sample from a running download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub total_estimate: Option<u64>,
    pub fragment_index: Option<u64>,
    pub fragment_count: Option<u64>,
}

impl DownloadProgress {
    pub fn expected(&self) -> Option<u64> {
        self.total.or(self.total_estimate)
    }

    pub fn fragments(&self) -> Option<(u64, u64)> {
        match (self.fragment_index, self.fragment_count) {
            (Some(i), Some(n)) if n > 0 => Some((i, n)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    /// Extractor format expression, e.g. `137` or `bestaudio/best`.
    pub format: String,
    pub dest_dir: PathBuf,
    pub stem: String,
    /// Abort when the source reports a larger size.
    pub max_bytes: Option<u64>,
}

pub type ProgressSink<'a> = &'a (dyn Fn(DownloadProgress) + Send + Sync);

/// Site extraction and local media tooling.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn fetch_metadata(&self, url: &str) -> Result<MediaMetadata, ExtractError>;

    async fn download(
        &self,
        req: &DownloadRequest,
        progress: ProgressSink<'_>,
        cancel: &JobCancel,
    ) -> Result<PathBuf, ExtractError>;

    /// Stream-copies the video track of `video` and audio track of `audio` into `dest`.
    async fn merge(&self, video: &Path, audio: &Path, dest: &Path, cancel: &JobCancel) -> Result<(), ExtractError>;

    async fn transcode_to_audio(
        &self,
        src: &Path,
        bitrate_kbps: u32,
        dest: &Path,
        cancel: &JobCancel,
    ) -> Result<(), ExtractError>;
}
