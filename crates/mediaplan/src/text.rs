use std::sync::LazyLock;

use regex::Regex;

static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(^|[^\w])#[\w\-]+").unwrap());
static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());
static FORBIDDEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).unwrap());
static FIRST_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static YOUTUBE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(https?://)?(www\.)?(youtube|youtu|youtube-nocookie)\.(com|be)/(watch\?v=|embed/|v/|.+\?v=)?([^&=%\?]{11})",
    )
    .unwrap()
});

const YOUTUBE_HOSTS: [&str; 3] = ["www.youtube.com", "youtube.com", "youtu.be"];

pub const MAX_FILENAME_CHARS: usize = 120;

/// Human readable size, 1024-based. `None` renders as "unknown".
pub fn fmt_bytes(n: Option<u64>) -> String {
    let Some(n) = n else {
        return "unknown".to_string();
    };
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut v = n as f64;
    let mut i = 0;
    while v >= 1024.0 && i < UNITS.len() - 1 {
        v /= 1024.0;
        i += 1;
    }
    if i == 0 {
        format!("{n} B")
    } else {
        format!("{v:.1} {}", UNITS[i])
    }
}

pub fn strip_hashtags(s: &str) -> String {
    let s = HASHTAG.replace_all(s, "$1");
    MULTI_SPACE.replace_all(&s, " ").trim().to_string()
}

/// Title usable as a file name on any common filesystem, without extension.
pub fn sanitize_filename_base(title: &str) -> String {
    let title = strip_hashtags(title);
    let title = FORBIDDEN.replace_all(&title, "");
    let title = title.trim().trim_end_matches(['.', ' ']).trim();
    if title.is_empty() {
        return "video".to_string();
    }
    if title.chars().count() > MAX_FILENAME_CHARS {
        let cut: String = title.chars().take(MAX_FILENAME_CHARS).collect();
        return cut.trim_end().to_string();
    }
    title.to_string()
}

/// Title shown in chat: hashtags removed, "Video" if nothing is left.
pub fn display_title(title: Option<&str>) -> String {
    let t = strip_hashtags(title.unwrap_or("").trim());
    if t.is_empty() {
        "Video".to_string()
    } else {
        t
    }
}

/// First http(s) URL in free text, without trailing punctuation.
pub fn extract_first_url(text: &str) -> Option<String> {
    let m = FIRST_URL.find(text.trim())?;
    let url = m.as_str().trim_end_matches([')', '.', ',', ']', '}', '>', '"', '\'']);
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

pub fn is_youtube_host(host: &str) -> bool {
    YOUTUBE_HOSTS.contains(&host)
}

/// Whether a YouTube link carries an 11 character video id.
pub fn is_valid_youtube_url(url: &str) -> bool {
    YOUTUBE.is_match(url)
}
