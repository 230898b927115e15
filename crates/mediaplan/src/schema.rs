use serde::{Deserialize, Deserializer, Serialize};

/// One downloadable rendition as reported by the extractor (`yt-dlp -J`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    /// Total bitrate, kbit/s.
    #[serde(default)]
    pub tbr: Option<f64>,
    /// Audio bitrate, kbit/s.
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub filesize: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
}

impl MediaFormat {
    // The extractor writes "none" for an absent stream; a missing field means unknown.
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    pub fn ext_is(&self, ext: &str) -> bool {
        self.ext.as_deref() == Some(ext)
    }

    /// Direct media URL, if the extractor resolved one over http(s).
    pub fn direct_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<MediaFormat>,
}

impl MediaMetadata {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Whole seconds rounded up, only when the source reports a positive duration.
    pub fn duration_secs(&self) -> Option<u64> {
        match self.duration {
            Some(d) if d.is_finite() && d > 0.0 => Some(d.ceil() as u64),
            _ => None,
        }
    }
}

// yt-dlp occasionally emits integral fields as floats (`"filesize_approx": 1234.0`).
fn lenient_u64<'de, D>(de: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(de)?;
    Ok(v.and_then(|v| match v {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => None,
    }))
}

fn lenient_u32<'de, D>(de: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_u64(de)?.and_then(|v| u32::try_from(v).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_extractor_json_with_nulls_and_floats() {
        let raw = br#"{
            "id": "abc",
            "title": "Clip",
            "duration": 61.4,
            "formats": [
                {"format_id": "18", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a",
                 "height": 360, "filesize": null, "filesize_approx": 1048576.0,
                 "url": "https://cdn.example/18.mp4"},
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a", "abr": 129.5}
            ]
        }"#;
        let meta = MediaMetadata::from_json(raw).unwrap();
        assert_eq!(meta.duration_secs(), Some(62));
        assert_eq!(meta.formats.len(), 2);
        assert_eq!(meta.formats[0].filesize, None);
        assert_eq!(meta.formats[0].filesize_approx, Some(1_048_576));
        assert!(meta.formats[0].has_video() && meta.formats[0].has_audio());
        assert!(!meta.formats[1].has_video());
        assert_eq!(meta.formats[1].direct_url(), None);
    }

    #[test]
    fn zero_duration_is_unknown() {
        let meta = MediaMetadata { duration: Some(0.0), ..Default::default() };
        assert_eq!(meta.duration_secs(), None);
    }

    #[test]
    fn fractional_duration_rounds_up() {
        let meta = MediaMetadata { duration: Some(1200.9), ..Default::default() };
        assert_eq!(meta.duration_secs(), Some(1201));
        let meta = MediaMetadata { duration: Some(0.4), ..Default::default() };
        assert_eq!(meta.duration_secs(), Some(1));
    }
}
