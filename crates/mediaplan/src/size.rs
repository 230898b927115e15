use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::MediaFormat;

/// Outcome of proving a delivery size. There is no best-effort guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeEstimate {
    Proven(u64),
    Unproven,
}

impl SizeEstimate {
    pub fn bytes(&self) -> Option<u64> {
        match self {
            SizeEstimate::Proven(n) => Some(*n),
            SizeEstimate::Unproven => None,
        }
    }

    /// Proven and not above `ceiling`.
    pub fn fits(&self, ceiling: u64) -> bool {
        matches!(self, SizeEstimate::Proven(n) if *n <= ceiling)
    }

    fn plus(self, other: SizeEstimate) -> SizeEstimate {
        match (self, other) {
            (SizeEstimate::Proven(a), SizeEstimate::Proven(b)) => {
                SizeEstimate::Proven(a.saturating_add(b))
            }
            _ => SizeEstimate::Unproven,
        }
    }
}

/// Reads the total length of a remote resource without fetching its body.
#[async_trait]
pub trait SizeProbe: Send + Sync {
    /// `None` when the server does not reveal a usable total.
    async fn total_len(&self, url: &str) -> Option<u64>;
}

/// Probe that never answers; metadata fields are the only evidence.
pub struct NoProbe;

#[async_trait]
impl SizeProbe for NoProbe {
    async fn total_len(&self, _url: &str) -> Option<u64> {
        None
    }
}

pub struct SizeProver<'a> {
    probe: &'a dyn SizeProbe,
}

impl<'a> SizeProver<'a> {
    pub fn new(probe: &'a dyn SizeProbe) -> Self {
        Self { probe }
    }

    /// Exact size, then the approximate field (accepted as authoritative),
    /// then a range probe of the direct URL.
    pub async fn prove_format(&self, format: &MediaFormat) -> SizeEstimate {
        if let Some(n) = format.filesize.filter(|n| *n > 0) {
            return SizeEstimate::Proven(n);
        }
        if let Some(n) = format.filesize_approx.filter(|n| *n > 0) {
            return SizeEstimate::Proven(n);
        }
        let Some(url) = format.direct_url() else {
            debug!(format_id = %format.format_id, "size: no evidence");
            return SizeEstimate::Unproven;
        };
        match self.probe.total_len(url).await {
            Some(n) if n > 0 => {
                debug!(format_id = %format.format_id, bytes = n, "size: proven by probe");
                SizeEstimate::Proven(n)
            }
            _ => {
                debug!(format_id = %format.format_id, "size: probe gave no total");
                SizeEstimate::Unproven
            }
        }
    }

    /// Size of a variant built from `streams` muxed together. Every stream
    /// must be proven; no container overhead is added.
    pub async fn prove(&self, streams: &[&MediaFormat]) -> SizeEstimate {
        if streams.is_empty() {
            return SizeEstimate::Unproven;
        }
        let mut total = SizeEstimate::Proven(0);
        for f in streams {
            total = total.plus(self.prove_format(f).await);
            if total == SizeEstimate::Unproven {
                break;
            }
        }
        total
    }
}
