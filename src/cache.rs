//! Content-addressed cache layout and the freshness rule deciding when a
//! cached source must be downloaded again.
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Lower-case hex SHA-256 of the source URL.
pub fn url_digest(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

/// `a/b/c/abc…` for depth 3: one directory per leading character, then the
/// full string. Depth 0 returns the string unchanged.
pub fn sharded(name: &str, depth: usize) -> PathBuf {
    let mut path = PathBuf::new();
    for ch in name.chars().take(depth) {
        path.push(ch.to_string());
    }
    path.push(name);
    path
}

/// Where the cached copy of `url` lives under `store_dir`.
pub fn cache_path(store_dir: &Path, url: &str, depth: usize) -> PathBuf {
    store_dir.join(sharded(&url_digest(url), depth))
}

/// Response metadata from a HEAD probe. Header values are kept raw; parse
/// failures simply make the header not count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeMetadata {
    pub last_modified: Option<String>,
    pub content_length: Option<String>,
}

/// Size and modification time of an existing cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedFile {
    pub len: u64,
    pub modified: DateTime<Utc>,
}

impl CachedFile {
    pub async fn stat(path: &Path) -> Option<Self> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        let modified: DateTime<Utc> = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH).into();
        Some(Self {
            len: meta.len(),
            modified,
        })
    }
}

/// Why a download was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadReason {
    NoCacheFile,
    NewerUpstream,
    SizeChanged,
}

impl DownloadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadReason::NoCacheFile => "no recorded cache file",
            DownloadReason::NewerUpstream => "upstream modified after cache",
            DownloadReason::SizeChanged => "upstream size differs",
        }
    }
}

/// Decide whether the source must be downloaded. Missing or unparseable
/// headers never trigger a download on their own.
pub fn needs_download(probe: &ProbeMetadata, cached: Option<&CachedFile>) -> Option<DownloadReason> {
    let Some(cached) = cached else {
        return Some(DownloadReason::NoCacheFile);
    };

    let upstream_modified = probe
        .last_modified
        .as_deref()
        .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc));
    if let Some(upstream) = upstream_modified {
        if upstream > cached.modified {
            return Some(DownloadReason::NewerUpstream);
        }
    }

    let upstream_len = probe
        .content_length
        .as_deref()
        .and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(len) = upstream_len {
        if len != cached.len {
            return Some(DownloadReason::SizeChanged);
        }
    }

    None
}
