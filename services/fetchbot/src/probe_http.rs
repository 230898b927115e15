use std::time::Duration;

use async_trait::async_trait;
use mediaplan::SizeProbe;
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tracing::debug;

/// Asks the origin for the first byte and reads the full length from the reply.
pub struct HttpRangeProbe {
    client: reqwest::Client,
}

impl HttpRangeProbe {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SizeProbe for HttpRangeProbe {
    async fn total_len(&self, url: &str) -> Option<u64> {
        if url::Url::parse(url).ok().filter(|u| matches!(u.scheme(), "http" | "https")).is_none() {
            return None;
        }
        let resp = match self.client.get(url).header(RANGE, "bytes=0-0").send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, "range probe failed");
                return None;
            }
        };

        let header = |name: HeaderName| resp.headers().get(name).and_then(|v| v.to_str().ok());
        let total = match resp.status() {
            StatusCode::PARTIAL_CONTENT => header(CONTENT_RANGE).and_then(parse_content_range),
            StatusCode::OK => header(CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok()),
            _ => None,
        };
        debug!(status = %resp.status(), ?total, "range probe");
        // the body is dropped unread
        total.filter(|n| *n > 0)
    }
}

/// Total from `bytes 0-0/12345`; `*` means the origin does not know.
fn parse_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}
