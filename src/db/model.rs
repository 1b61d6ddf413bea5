//! Row and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Stage logic
//! lives in `fetcher`, `compiler` and `publisher`.

use chrono::{DateTime, Utc};

/// An active source as seen by the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchableSource {
    pub id: i64,
    pub scheme: String,
    pub urn: String,
    pub cache_path: Option<String>,
}

impl FetchableSource {
    /// Full URL as probed and downloaded.
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.urn)
    }
}

/// Freshness bookkeeping for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub source_id: i64,
    pub active: bool,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Watermarks for one compilation. `updated_at` is the epoch until the
/// first successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationStatus {
    pub compilation_id: String,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Everything the merge engine needs besides the member files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationForMerge {
    pub id: String,
    pub name: String,
    pub output_path: Option<String>,
    pub public_url: Option<String>,
    pub filter_include: Option<String>,
    pub filter_exclude: Option<String>,
}

/// A compilation whose artifact is newer than its last publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCandidate {
    pub id: String,
    pub output_path: Option<String>,
    pub public_url: Option<String>,
    /// The `updated` watermark observed when the candidate was selected.
    pub updated_at: DateTime<Utc>,
}
