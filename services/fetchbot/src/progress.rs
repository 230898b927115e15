use std::time::Duration;

use mediaplan::fmt_bytes;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Downloading,
    Transcoding,
    Uploading,
}

impl Phase {
    fn label(&self) -> &'static str {
        match self {
            Phase::Downloading => "⬇️ Downloading...",
            Phase::Transcoding => "🔄 Converting...",
            Phase::Uploading => "⬆️ Uploading...",
        }
    }
}

/// Transfer progress of the running job. Written only by its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub phase: Phase,
    pub transferred: u64,
    pub expected: Option<u64>,
    /// Display percentage; monotonic within a phase.
    pub percent: Option<u8>,
}

impl ProgressState {
    pub fn new(phase: Phase, expected: Option<u64>) -> Self {
        Self { phase, transferred: 0, expected, percent: None }
    }

    /// Records a new percentage without ever going backwards, and without
    /// claiming 100% before the phase is finished.
    pub fn bump_percent(&mut self, pct: u64) {
        let pct = pct.min(99) as u8;
        self.percent = Some(self.percent.map_or(pct, |p| p.max(pct)));
    }

    /// Percentage from fragment counters when present, else from bytes.
    pub fn observe(&mut self, transferred: u64, expected: Option<u64>, fragments: Option<(u64, u64)>) {
        self.transferred = transferred;
        if expected.is_some() {
            self.expected = expected;
        }
        match (fragments, self.expected) {
            (Some((index, count)), _) if count > 0 => self.bump_percent(index.min(count) * 100 / count),
            (_, Some(total)) if total > 0 => self.bump_percent(transferred.saturating_mul(100) / total),
            _ => {}
        }
    }

    pub fn finish(&mut self) {
        self.percent = Some(100);
        if let Some(total) = self.expected {
            self.transferred = total;
        }
    }
}

/// Pure rendering; equal inputs give equal text.
pub fn render_progress(title: &str, state: &ProgressState) -> String {
    let mut line = format!("Status: {}", state.phase.label());
    if state.phase == Phase::Transcoding {
        return format!("{title}\n\n{line}");
    }
    match (state.percent, state.expected) {
        (Some(pct), Some(total)) => {
            line.push_str(&format!(" {pct}%\n{} / {}", fmt_bytes(Some(state.transferred)), fmt_bytes(Some(total))));
        }
        (Some(pct), None) => line.push_str(&format!(" {pct}%")),
        (None, _) if state.transferred > 0 => {
            line.push_str(&format!("\n{}", fmt_bytes(Some(state.transferred))));
        }
        (None, _) => {}
    }
    format!("{title}\n\n{line}")
}

/// Decides when a progress edit may go out: on a phase change, or once the
/// minimum interval has passed since the last emitted update.
#[derive(Debug)]
pub struct ProgressReporter {
    title: String,
    min_interval: Duration,
    last_emitted: Option<Instant>,
    last_phase: Option<Phase>,
    last_text: Option<String>,
}

impl ProgressReporter {
    pub fn new(title: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            title: title.into(),
            min_interval,
            last_emitted: None,
            last_phase: None,
            last_text: None,
        }
    }

    pub fn maybe_emit(&mut self, state: &ProgressState) -> Option<String> {
        let now = Instant::now();
        let phase_changed = self.last_phase != Some(state.phase);
        let due = self
            .last_emitted
            .map_or(true, |at| now.duration_since(at) >= self.min_interval);
        if !phase_changed && !due {
            return None;
        }

        let text = render_progress(&self.title, state);
        if self.last_text.as_deref() == Some(text.as_str()) {
            return None;
        }
        self.last_emitted = Some(now);
        self.last_phase = Some(state.phase);
        self.last_text = Some(text.clone());
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn downloading(done: u64, total: u64) -> ProgressState {
        let mut s = ProgressState::new(Phase::Downloading, Some(total));
        s.observe(done, None, None);
        s
    }

    #[test]
    fn renders_percent_and_bytes() {
        let text = render_progress("Clip", &downloading(21 * MB, 50 * MB));
        assert_eq!(text, "Clip\n\nStatus: ⬇️ Downloading... 42%\n21.0 MB / 50.0 MB");
    }

    #[test]
    fn renders_raw_bytes_when_total_unknown() {
        let mut s = ProgressState::new(Phase::Uploading, None);
        s.observe(3 * MB, None, None);
        assert_eq!(render_progress("Clip", &s), "Clip\n\nStatus: ⬆️ Uploading...\n3.0 MB");
    }

    #[test]
    fn percent_is_monotonic_capped_and_prefers_fragments() {
        let mut s = ProgressState::new(Phase::Downloading, Some(100));
        s.observe(100, None, None);
        assert_eq!(s.percent, Some(99));
        s.observe(10, None, None);
        assert_eq!(s.percent, Some(99));

        let mut f = ProgressState::new(Phase::Downloading, Some(1000));
        f.observe(900, None, Some((1, 4)));
        assert_eq!(f.percent, Some(25));
        f.finish();
        assert_eq!(f.percent, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn throttles_within_interval_but_not_on_phase_change() {
        let mut r = ProgressReporter::new("Clip", Duration::from_millis(1800));
        assert!(r.maybe_emit(&downloading(MB, 50 * MB)).is_some());
        assert!(r.maybe_emit(&downloading(2 * MB, 50 * MB)).is_none());

        let up = ProgressState::new(Phase::Uploading, Some(50 * MB));
        assert!(r.maybe_emit(&up).is_some(), "phase change bypasses the interval");

        tokio::time::advance(Duration::from_millis(1800)).await;
        let mut up2 = up.clone();
        up2.observe(10 * MB, None, None);
        assert!(r.maybe_emit(&up2).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_text_is_not_re_emitted() {
        let mut r = ProgressReporter::new("Clip", Duration::from_millis(100));
        let s = downloading(5 * MB, 50 * MB);
        assert!(r.maybe_emit(&s).is_some());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(r.maybe_emit(&s).is_none());
        assert_eq!(render_progress("Clip", &s), render_progress("Clip", &s));
    }
}
