#![forbid(unsafe_code)]

//! Everything the ingestion handler needs to know about YouTube: which URLs
//! are accepted, how the video id is pulled out of them, and how title and
//! thumbnails are looked up.

use std::{collections::HashMap, path::PathBuf, process::Command, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

const OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static! {
    static ref YT_REGEX: Regex = Regex::new(
        r"^(?:(?:https?:)?//)?(?:(?:www|m|music)\.)?(?:youtu\.be/|youtube(?:-nocookie)?\.com/(?:watch(?:/|\?(?:[^#\s]*&)?v=)|embed/|v/|shorts/|live/))([A-Za-z0-9_-]{11})(?:[?&#/][^\s]*)?$"
    )
    .unwrap();
}

/// Returns the 11 character video id for any accepted YouTube URL.
pub fn extract_video_id(url: &str) -> Option<String> {
    YT_REGEX
        .captures(url.trim())
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}

pub fn is_youtube_url(url: &str) -> bool {
    extract_video_id(url).is_some()
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDetails {
    pub title: String,
    pub thumbnails: Vec<Thumbnail>,
}

impl VideoDetails {
    /// Placeholder details used when no lookup service is configured.
    pub fn offline(video_id: &str) -> Self {
        Self {
            title: video_id.to_string(),
            thumbnails: default_thumbnails(video_id),
        }
    }

    /// Small and big thumbnail URLs, falling back to the static image CDN
    /// when the lookup returned nothing usable.
    pub fn images(&self, video_id: &str) -> (String, String) {
        pick_thumbnails(&self.thumbnails)
            .or_else(|| pick_thumbnails(&default_thumbnails(video_id)))
            .unwrap_or_default()
    }
}

/// Thumbnails served by the public image CDN for every video.
pub fn default_thumbnails(video_id: &str) -> Vec<Thumbnail> {
    vec![
        Thumbnail {
            url: format!("https://i.ytimg.com/vi/{video_id}/mqdefault.jpg"),
            width: Some(320),
        },
        Thumbnail {
            url: format!("https://i.ytimg.com/vi/{video_id}/hqdefault.jpg"),
            width: Some(480),
        },
    ]
}

/// Picks `(small, big)`: the widest thumbnail is big, the runner-up is small.
/// With a single candidate both point at it.
pub fn pick_thumbnails(thumbnails: &[Thumbnail]) -> Option<(String, String)> {
    let mut sorted: Vec<&Thumbnail> = thumbnails
        .iter()
        .filter(|thumb| !thumb.url.trim().is_empty())
        .collect();
    sorted.sort_by_key(|thumb| thumb.width.unwrap_or(0));

    let big = sorted.last()?;
    let small = if sorted.len() > 1 {
        sorted[sorted.len() - 2]
    } else {
        big
    };
    Some((small.url.clone(), big.url.clone()))
}

/// Which service answers metadata lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetadataProvider {
    #[default]
    OEmbed,
    YtDlp,
    Offline,
}

impl MetadataProvider {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "oembed" => Some(Self::OEmbed),
            "ytdlp" | "yt-dlp" => Some(Self::YtDlp),
            "none" | "off" | "offline" => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn build(self) -> Arc<dyn VideoLookup> {
        match self {
            Self::OEmbed => Arc::new(CachedLookup::new(OEmbedLookup::new())),
            Self::YtDlp => Arc::new(CachedLookup::new(YtDlpLookup::default())),
            Self::Offline => Arc::new(OfflineLookup),
        }
    }
}

/// Resolves details for a video id. Implementations block; callers run them
/// on `spawn_blocking`.
pub trait VideoLookup: Send + Sync {
    fn name(&self) -> &'static str;

    fn lookup(&self, video_id: &str) -> Result<VideoDetails>;
}

pub struct OfflineLookup;

impl VideoLookup for OfflineLookup {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn lookup(&self, video_id: &str) -> Result<VideoDetails> {
        Ok(VideoDetails::offline(video_id))
    }
}

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    title: String,
    thumbnail_url: Option<String>,
    thumbnail_width: Option<u32>,
}

/// Public oEmbed endpoint. Returns an error for private or deleted videos.
pub struct OEmbedLookup {
    agent: ureq::Agent,
    endpoint: String,
}

impl OEmbedLookup {
    pub fn new() -> Self {
        Self::with_endpoint(OEMBED_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(LOOKUP_TIMEOUT).build(),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for OEmbedLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoLookup for OEmbedLookup {
    fn name(&self) -> &'static str {
        "oembed"
    }

    fn lookup(&self, video_id: &str) -> Result<VideoDetails> {
        let video_url = watch_url(video_id);
        let response: OEmbedResponse = self
            .agent
            .get(&self.endpoint)
            .query("url", &video_url)
            .query("format", "json")
            .call()
            .with_context(|| format!("requesting oEmbed details for {video_url}"))?
            .into_json()
            .context("parsing oEmbed response")?;

        let mut thumbnails = default_thumbnails(video_id);
        if let Some(url) = response.thumbnail_url
            && !url.trim().is_empty()
        {
            thumbnails.retain(|thumb| thumb.url != url);
            thumbnails.push(Thumbnail {
                url,
                width: response.thumbnail_width,
            });
        }

        Ok(VideoDetails {
            title: response.title,
            thumbnails,
        })
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

/// Shells out to `yt-dlp`, which must be on `PATH` unless a binary is given.
pub struct YtDlpLookup {
    binary: PathBuf,
}

impl YtDlpLookup {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for YtDlpLookup {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl VideoLookup for YtDlpLookup {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn lookup(&self, video_id: &str) -> Result<VideoDetails> {
        let video_url = watch_url(video_id);
        let output = Command::new(&self.binary)
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(&video_url)
            .output()
            .with_context(|| format!("fetching metadata for {video_url}"))?;

        if !output.status.success() {
            bail!("yt-dlp failed for {} (status {})", video_url, output.status);
        }

        parse_ytdlp_info(&output.stdout, video_id)
    }
}

fn parse_ytdlp_info(raw: &[u8], video_id: &str) -> Result<VideoDetails> {
    let info: YtDlpInfo =
        serde_json::from_slice(raw).context("parsing yt-dlp metadata response")?;
    Ok(VideoDetails {
        title: info.title.unwrap_or_else(|| video_id.to_string()),
        thumbnails: info.thumbnails,
    })
}

/// Memoizes successful lookups so the same video submitted twice only hits
/// the network once. Failures are not cached.
pub struct CachedLookup<L> {
    inner: L,
    cache: RwLock<HashMap<String, VideoDetails>>,
}

impl<L: VideoLookup> CachedLookup<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

impl<L: VideoLookup> VideoLookup for CachedLookup<L> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn lookup(&self, video_id: &str) -> Result<VideoDetails> {
        if let Some(hit) = self.cache.read().get(video_id).cloned() {
            return Ok(hit);
        }
        let details = self.inner.lookup(video_id)?;
        self.cache
            .write()
            .insert(video_id.to_string(), details.clone());
        Ok(details)
    }
}
