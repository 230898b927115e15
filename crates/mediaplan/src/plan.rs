use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{fmt_bytes, MediaFormat, MediaMetadata, SizeEstimate, SizeProbe, SizeProver};

/// MPEG-1 Layer III bitrates, kbit/s, highest first.
pub const MP3_BITRATES_KBPS: [u32; 14] = [320, 256, 224, 192, 160, 128, 112, 96, 80, 64, 56, 48, 40, 32];

pub const DEFAULT_AUDIO_HEADROOM: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanKind {
    /// One file carrying both video and audio.
    Progressive,
    /// Separate video and audio streams muxed after download.
    Merged,
    /// Best audio transcoded to MP3.
    Audio,
}

/// How the user wants the media delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    Video,
    Document,
    Audio,
}

impl DeliveryMode {
    pub const ALL: [DeliveryMode; 3] = [DeliveryMode::Video, DeliveryMode::Document, DeliveryMode::Audio];

    /// Compact tag used inside button payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            DeliveryMode::Video => "video",
            DeliveryMode::Document => "doc",
            DeliveryMode::Audio => "audio",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "video" => Some(DeliveryMode::Video),
            "doc" => Some(DeliveryMode::Document),
            "audio" => Some(DeliveryMode::Audio),
            _ => None,
        }
    }

    pub fn button_label(&self) -> &'static str {
        match self {
            DeliveryMode::Video => "Download as Video",
            DeliveryMode::Document => "Download as Document",
            DeliveryMode::Audio => "Download as Audio (MP3)",
        }
    }
}

/// What the extractor is asked to download for a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatSelection {
    Single { format_id: String },
    Merged { video_id: String, audio_id: String },
    BestAudio,
}

impl FormatSelection {
    pub fn spec(&self) -> String {
        match self {
            FormatSelection::Single { format_id } => format_id.clone(),
            FormatSelection::Merged { video_id, audio_id } => format!("{video_id}+{audio_id}"),
            FormatSelection::BestAudio => "bestaudio/best".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub kind: PlanKind,
    pub size: SizeEstimate,
    pub selection: FormatSelection,
    /// Container of the delivered file.
    pub container: String,
    pub quality_label: String,
    pub audio_bitrate_kbps: Option<u32>,
}

/// Why a mode is not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Refusal {
    #[error("proven size {} is over the limit {}", human(.size), human(.ceiling))]
    TooLarge { size: u64, ceiling: u64 },
    #[error("the final size cannot be determined before downloading")]
    Unprovable,
    #[error("the duration is unknown, so the MP3 size cannot be estimated")]
    NoDuration,
    #[error("the audio is too long to fit into {} even at the lowest bitrate", human(.ceiling))]
    TooLong { ceiling: u64 },
}

/// The video plan (shared by video and document delivery) and the audio plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanBook {
    pub video: Result<Plan, Refusal>,
    pub audio: Result<Plan, Refusal>,
}

impl PlanBook {
    pub fn plan_for(&self, mode: DeliveryMode) -> Option<&Plan> {
        match mode {
            DeliveryMode::Video | DeliveryMode::Document => self.video.as_ref().ok(),
            DeliveryMode::Audio => self.audio.as_ref().ok(),
        }
    }

    pub fn offered_modes(&self) -> Vec<DeliveryMode> {
        DeliveryMode::ALL
            .into_iter()
            .filter(|m| self.plan_for(*m).is_some())
            .collect()
    }

    /// Offered plans with the mode they serve.
    pub fn plans(&self) -> Vec<(DeliveryMode, &Plan)> {
        DeliveryMode::ALL
            .into_iter()
            .filter_map(|m| self.plan_for(m).map(|p| (m, p)))
            .collect()
    }

    pub fn is_refused(&self) -> bool {
        self.video.is_err() && self.audio.is_err()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanPolicy {
    pub ceiling: u64,
    pub audio_headroom: f64,
}

impl PlanPolicy {
    pub fn new(ceiling: u64) -> Self {
        Self { ceiling, audio_headroom: DEFAULT_AUDIO_HEADROOM }
    }
}

pub struct PlanSelector<'a> {
    prover: SizeProver<'a>,
    policy: PlanPolicy,
}

impl<'a> PlanSelector<'a> {
    pub fn new(probe: &'a dyn SizeProbe, policy: PlanPolicy) -> Self {
        Self { prover: SizeProver::new(probe), policy }
    }

    pub async fn build_plans(&self, meta: &MediaMetadata) -> PlanBook {
        let video = self.plan_video(meta).await;
        let audio = plan_audio(meta.duration_secs(), &self.policy);
        debug!(video = ?video.as_ref().map(|p| p.size), audio = ?audio.as_ref().map(|p| p.size), "plans built");
        PlanBook { video, audio }
    }

    /// Best progressive MP4 if it proves within the ceiling, otherwise the
    /// best video-only MP4 plus best audio-only track. Quality is never lowered.
    pub async fn plan_video(&self, meta: &MediaMetadata) -> Result<Plan, Refusal> {
        let ceiling = self.policy.ceiling;
        let mut smallest_over: Option<u64> = None;
        let mut note_over = |size: u64| {
            smallest_over = Some(smallest_over.map_or(size, |s: u64| s.min(size)));
        };

        if let Some(f) = best_progressive(&meta.formats) {
            match self.prover.prove(&[f]).await {
                size @ SizeEstimate::Proven(n) if n <= ceiling => {
                    return Ok(Plan {
                        kind: PlanKind::Progressive,
                        size,
                        selection: FormatSelection::Single { format_id: f.format_id.clone() },
                        container: "mp4".to_string(),
                        quality_label: height_label(f.height, "mp4"),
                        audio_bitrate_kbps: None,
                    });
                }
                SizeEstimate::Proven(n) => note_over(n),
                SizeEstimate::Unproven => {}
            }
        }

        if let Some((v, a)) = best_video_audio_pair(&meta.formats) {
            match self.prover.prove(&[v, a]).await {
                size @ SizeEstimate::Proven(n) if n <= ceiling => {
                    return Ok(Plan {
                        kind: PlanKind::Merged,
                        size,
                        selection: FormatSelection::Merged {
                            video_id: v.format_id.clone(),
                            audio_id: a.format_id.clone(),
                        },
                        container: "mp4".to_string(),
                        quality_label: height_label(v.height, "mp4"),
                        audio_bitrate_kbps: None,
                    });
                }
                SizeEstimate::Proven(n) => note_over(n),
                SizeEstimate::Unproven => {}
            }
        }

        Err(match smallest_over {
            Some(size) => Refusal::TooLarge { size, ceiling },
            None => Refusal::Unprovable,
        })
    }
}

/// MP3 plan at the highest standard bitrate that fits with headroom.
pub fn plan_audio(duration_secs: Option<u64>, policy: &PlanPolicy) -> Result<Plan, Refusal> {
    let duration = duration_secs.filter(|d| *d > 0).ok_or(Refusal::NoDuration)?;
    let kbps = pick_mp3_bitrate(duration, policy.ceiling, policy.audio_headroom)
        .ok_or(Refusal::TooLong { ceiling: policy.ceiling })?;
    Ok(Plan {
        kind: PlanKind::Audio,
        size: SizeEstimate::Proven(mp3_size_bytes(kbps, duration)),
        selection: FormatSelection::BestAudio,
        container: "mp3".to_string(),
        quality_label: format!("mp3 {kbps}kbps"),
        audio_bitrate_kbps: Some(kbps),
    })
}

/// Encoded size of `duration_secs` of constant-bitrate audio.
pub fn mp3_size_bytes(kbps: u32, duration_secs: u64) -> u64 {
    u64::from(kbps) * 1000 / 8 * duration_secs
}

/// Highest entry of [`MP3_BITRATES_KBPS`] with `size * (1 + headroom) <= ceiling`.
pub fn pick_mp3_bitrate(duration_secs: u64, ceiling: u64, headroom: f64) -> Option<u32> {
    MP3_BITRATES_KBPS.into_iter().find(|kbps| {
        let est = mp3_size_bytes(*kbps, duration_secs) as f64;
        est * (1.0 + headroom) <= ceiling as f64
    })
}

fn human(n: &u64) -> String {
    fmt_bytes(Some(*n))
}

fn height_label(height: Option<u32>, fallback: &str) -> String {
    match height {
        Some(h) if h > 0 => format!("{h}p"),
        _ => fallback.to_string(),
    }
}

fn video_rank(f: &MediaFormat) -> (u32, f64, f64) {
    (f.height.unwrap_or(0), f.fps.unwrap_or(0.0), f.tbr.unwrap_or(0.0))
}

fn cmp_video_rank(a: &MediaFormat, b: &MediaFormat) -> Ordering {
    let (ha, fa, ta) = video_rank(a);
    let (hb, fb, tb) = video_rank(b);
    ha.cmp(&hb).then(fa.total_cmp(&fb)).then(ta.total_cmp(&tb))
}

fn cmp_audio_rank(a: &MediaFormat, b: &MediaFormat) -> Ordering {
    let ra = a.abr.or(a.tbr).unwrap_or(0.0);
    let rb = b.abr.or(b.tbr).unwrap_or(0.0);
    ra.total_cmp(&rb)
}

// First of the maximal elements, so listing order breaks ties.
fn best_by<'f, I, F>(iter: I, cmp: F) -> Option<&'f MediaFormat>
where
    I: IntoIterator<Item = &'f MediaFormat>,
    F: Fn(&MediaFormat, &MediaFormat) -> Ordering,
{
    iter.into_iter().fold(None, |best, f| match best {
        Some(b) if cmp(f, b) != Ordering::Greater => Some(b),
        _ => Some(f),
    })
}

pub fn best_progressive(formats: &[MediaFormat]) -> Option<&MediaFormat> {
    best_by(
        formats.iter().filter(|f| f.ext_is("mp4") && f.has_video() && f.has_audio()),
        cmp_video_rank,
    )
}

pub fn best_video_audio_pair(formats: &[MediaFormat]) -> Option<(&MediaFormat, &MediaFormat)> {
    let video = best_by(
        formats.iter().filter(|f| f.ext_is("mp4") && f.has_video() && !f.has_audio()),
        cmp_video_rank,
    )?;
    let audio = best_by(
        formats
            .iter()
            .filter(|f| !f.has_video() && f.has_audio() && (f.ext_is("m4a") || f.ext_is("mp4"))),
        cmp_audio_rank,
    )?;
    Some((video, audio))
}
