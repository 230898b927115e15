use std::fmt;
use std::path::PathBuf;

use mediaplan::Refusal;
use thiserror::Error;

use crate::types::JobState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Download,
    Merge,
    Transcode,
    Upload,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferStage::Download => "download",
            TransferStage::Merge => "merge",
            TransferStage::Transcode => "transcode",
            TransferStage::Upload => "upload",
        })
    }
}

/// Failures of the extraction collaborator.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cancelled")]
    Cancelled,

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {detail}")]
    Tool { tool: String, status: String, detail: String },

    #[error("invalid metadata: {0}")]
    Metadata(String),

    #[error("media is {size} bytes, over the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("downloaded file not found in {}", .0.display())]
    OutputMissing(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the chat transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cancelled")]
    Cancelled,

    #[error("request failed: {0}")]
    Http(reqwest::Error),

    #[error("api error: {0}")]
    Api(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// Bot API URLs embed the token; it must never reach logs or chat text.
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Http(e.without_url())
    }
}

/// Why a request or job stopped short of delivery.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("could not fetch media info: {0}")]
    MetadataFetch(String),

    #[error("no deliverable plan: {0}")]
    SizeUnprovable(Refusal),

    #[error("the job queue is full")]
    QueueFull,

    #[error("the choice expired")]
    ExpiredChoice,

    #[error("cancelled by user")]
    Cancelled,

    #[error("{stage} failed: {message}")]
    Transfer { stage: TransferStage, message: String },

    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },
}

impl LifecycleError {
    pub fn transfer(stage: TransferStage, err: impl fmt::Display) -> Self {
        LifecycleError::Transfer { stage, message: err.to_string() }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LifecycleError::Cancelled)
    }
}

impl ExtractError {
    pub fn at(self, stage: TransferStage) -> LifecycleError {
        match self {
            ExtractError::Cancelled => LifecycleError::Cancelled,
            other => LifecycleError::transfer(stage, other),
        }
    }
}

impl TransportError {
    pub fn at(self, stage: TransferStage) -> LifecycleError {
        match self {
            TransportError::Cancelled => LifecycleError::Cancelled,
            other => LifecycleError::transfer(stage, other),
        }
    }
}
