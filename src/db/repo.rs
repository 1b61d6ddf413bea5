use super::model::{
    CompilationForMerge, CompilationStatus, FetchableSource, PublishCandidate, SourceStatus,
};
use crate::clock::from_millis;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePoolOptions::new()
        .connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Three processes share this file; WAL keeps readers off the writer's back.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

// ---------------------------------------------------------------------------
// Sources (fetcher side)
// ---------------------------------------------------------------------------

/// Sources the fetcher should probe: active ones, plus those that have never
/// been probed and so have no status row yet.
#[instrument(skip_all)]
pub async fn fetchable_sources(pool: &Pool) -> Result<Vec<FetchableSource>> {
    let rows = sqlx::query(
        "SELECT s.id, s.scheme, s.urn, s.cache_path \
         FROM sources s \
         LEFT JOIN source_status st ON st.source_id = s.id \
         WHERE st.active IS NULL OR st.active = 1 \
         ORDER BY s.id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| FetchableSource {
            id: row.get("id"),
            scheme: row.get("scheme"),
            urn: row.get("urn"),
            cache_path: row
                .get::<Option<String>, _>("cache_path")
                .filter(|p| !p.trim().is_empty()),
        })
        .collect())
}

/// Create the status row with defaults (active, never refreshed) if missing.
#[instrument(skip_all)]
pub async fn ensure_source_status(pool: &Pool, source_id: i64) -> Result<bool> {
    let res = sqlx::query("INSERT OR IGNORE INTO source_status (source_id) VALUES (?)")
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn mark_source_refreshed(pool: &Pool, source_id: i64, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE source_status SET refreshed_at = MAX(COALESCE(refreshed_at, 0), ?) WHERE source_id = ?",
    )
    .bind(millis(at))
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a completed download: advance `updated` (and `refreshed` with it,
/// so `updated <= refreshed` holds) and remember where the file lives.
#[instrument(skip_all)]
pub async fn mark_source_updated(
    pool: &Pool,
    source_id: i64,
    at: DateTime<Utc>,
    cache_path: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE source_status \
         SET updated_at = MAX(COALESCE(updated_at, 0), ?), \
             refreshed_at = MAX(COALESCE(refreshed_at, 0), ?) \
         WHERE source_id = ?",
    )
    .bind(millis(at))
    .bind(millis(at))
    .bind(source_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE sources SET cache_path = ? WHERE id = ?")
        .bind(cache_path)
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_source_active(pool: &Pool, source_id: i64, active: bool) -> Result<()> {
    sqlx::query(
        "INSERT INTO source_status (source_id, active) VALUES (?, ?) \
         ON CONFLICT(source_id) DO UPDATE SET active = excluded.active",
    )
    .bind(source_id)
    .bind(active)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn source_status(pool: &Pool, source_id: i64) -> Result<Option<SourceStatus>> {
    let row = sqlx::query(
        "SELECT source_id, active, refreshed_at, updated_at FROM source_status WHERE source_id = ?",
    )
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| SourceStatus {
        source_id: row.get("source_id"),
        active: row.get::<i64, _>("active") != 0,
        refreshed_at: row.get::<Option<i64>, _>("refreshed_at").map(from_millis),
        updated_at: row.get::<Option<i64>, _>("updated_at").map(from_millis),
    }))
}

// ---------------------------------------------------------------------------
// Compilations (compiler side)
// ---------------------------------------------------------------------------

/// Give every compilation lacking a status row one with `updated = 0`.
/// Returns how many rows were created.
#[instrument(skip_all)]
pub async fn ensure_compilation_statuses(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO compilation_status (compilation_id) SELECT id FROM compilations",
    )
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Compilations with at least one member source updated after the
/// compilation itself. Compilations without members or without a status row
/// never qualify.
#[instrument(skip_all)]
pub async fn compile_candidates(pool: &Pool) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT c.id \
         FROM compilations c \
         JOIN compilation_status cs ON cs.compilation_id = c.id \
         JOIN compilation_sources m ON m.compilation_id = c.id \
         JOIN source_status st ON st.source_id = m.source_id \
         WHERE st.updated_at IS NOT NULL AND st.updated_at > cs.updated_at \
         ORDER BY c.id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn compilation_for_merge(pool: &Pool, id: &str) -> Result<Option<CompilationForMerge>> {
    let row = sqlx::query(
        "SELECT id, name, output_path, public_url, filter_include, filter_exclude \
         FROM compilations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    Ok(row.map(|row| CompilationForMerge {
        id: row.get("id"),
        name: row.get("name"),
        output_path: non_blank(row.get("output_path")),
        public_url: non_blank(row.get("public_url")),
        filter_include: non_blank(row.get("filter_include")),
        filter_exclude: non_blank(row.get("filter_exclude")),
    }))
}

/// Cache files of the compilation's members that have been downloaded at
/// least once.
#[instrument(skip_all)]
pub async fn member_cache_files(pool: &Pool, id: &str) -> Result<Vec<String>> {
    let files: Vec<String> = sqlx::query_scalar(
        "SELECT s.cache_path FROM sources s \
         JOIN compilation_sources m ON m.source_id = s.id \
         WHERE m.compilation_id = ? AND s.cache_path IS NOT NULL AND s.cache_path <> '' \
         ORDER BY s.id",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;
    Ok(files)
}

/// Advance the merge watermark. Returns false when the status row is gone
/// (e.g. the compilation was deleted mid-pass).
#[instrument(skip_all)]
pub async fn mark_compilation_updated(pool: &Pool, id: &str, at: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE compilation_status SET updated_at = MAX(updated_at, ?) WHERE compilation_id = ?",
    )
    .bind(millis(at))
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Compilations merged at least once whose last merge has not been published.
#[instrument(skip_all)]
pub async fn publish_candidates(pool: &Pool) -> Result<Vec<PublishCandidate>> {
    let rows = sqlx::query(
        "SELECT c.id, c.output_path, c.public_url, cs.updated_at \
         FROM compilation_status cs \
         JOIN compilations c ON c.id = cs.compilation_id \
         WHERE cs.updated_at > 0 \
           AND (cs.published_at IS NULL OR cs.updated_at > cs.published_at) \
         ORDER BY c.id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| PublishCandidate {
            id: row.get("id"),
            output_path: row
                .get::<Option<String>, _>("output_path")
                .filter(|s| !s.trim().is_empty()),
            public_url: row
                .get::<Option<String>, _>("public_url")
                .filter(|s| !s.trim().is_empty()),
            updated_at: from_millis(row.get("updated_at")),
        })
        .collect())
}

/// Record a successful publication of the artifact merged at `watermark`.
#[instrument(skip_all)]
pub async fn mark_compilation_published(
    pool: &Pool,
    id: &str,
    watermark: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE compilation_status SET published_at = MAX(COALESCE(published_at, 0), ?) \
         WHERE compilation_id = ?",
    )
    .bind(millis(watermark))
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn compilation_status(pool: &Pool, id: &str) -> Result<Option<CompilationStatus>> {
    let row = sqlx::query(
        "SELECT compilation_id, updated_at, published_at FROM compilation_status WHERE compilation_id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| CompilationStatus {
        compilation_id: row.get("compilation_id"),
        updated_at: from_millis(row.get("updated_at")),
        published_at: row.get::<Option<i64>, _>("published_at").map(from_millis),
    }))
}

// ---------------------------------------------------------------------------
// Catalog (management side)
// ---------------------------------------------------------------------------

/// Column values for a new compilation row.
#[derive(Debug, Clone)]
pub struct NewCompilationRow<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub password: Option<&'a str>,
    pub filter_include: Option<&'a str>,
    pub filter_exclude: Option<&'a str>,
    pub output_path: &'a str,
    pub public_url: &'a str,
}

/// Field updates for an existing compilation. `None` leaves a column alone.
#[derive(Debug, Clone, Default)]
pub struct CompilationChanges<'a> {
    pub add_sources: &'a [i64],
    pub delete_sources: &'a [i64],
    pub password: Option<&'a str>,
    pub name: Option<&'a str>,
    pub filter_include: Option<&'a str>,
    pub filter_exclude: Option<&'a str>,
}

pub async fn find_source_id(pool: &Pool, scheme: &str, urn: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM sources WHERE scheme = ? AND urn = ?")
        .bind(scheme)
        .bind(urn)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

/// Insert a source unless the same scheme/URN exists; returns its id either way.
#[instrument(skip_all)]
pub async fn insert_source(pool: &Pool, scheme: &str, urn: &str, at: DateTime<Utc>) -> Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO sources (scheme, urn, created_at) VALUES (?, ?, ?)")
        .bind(scheme)
        .bind(urn)
        .bind(millis(at))
        .execute(pool)
        .await?;
    find_source_id(pool, scheme, urn)
        .await?
        .with_context(|| format!("source {}://{} vanished after insert", scheme, urn))
}

/// Write the compilation, its memberships and its status row in one transaction.
#[instrument(skip_all)]
pub async fn insert_compilation(
    pool: &Pool,
    row: &NewCompilationRow<'_>,
    source_ids: &[i64],
    at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO compilations \
         (id, name, password, filter_include, filter_exclude, output_path, public_url, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(row.id)
    .bind(row.name)
    .bind(row.password)
    .bind(row.filter_include)
    .bind(row.filter_exclude)
    .bind(row.output_path)
    .bind(row.public_url)
    .bind(millis(at))
    .execute(&mut *tx)
    .await?;
    for source_id in source_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO compilation_sources (compilation_id, source_id) VALUES (?, ?)",
        )
        .bind(row.id)
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query("INSERT OR IGNORE INTO compilation_status (compilation_id) VALUES (?)")
        .bind(row.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn compilation_exists(pool: &Pool, id: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM compilations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// `None` if the compilation does not exist, `Some(None)` if it has no password.
pub async fn compilation_password(pool: &Pool, id: &str) -> Result<Option<Option<String>>> {
    let row = sqlx::query("SELECT password FROM compilations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| {
        row.get::<Option<String>, _>("password")
            .filter(|p| !p.is_empty())
    }))
}

/// Name, filters and member URLs of a compilation.
pub async fn compilation_details(
    pool: &Pool,
    id: &str,
) -> Result<Option<(CompilationForMerge, Vec<String>)>> {
    let Some(compilation) = compilation_for_merge(pool, id).await? else {
        return Ok(None);
    };
    let urls: Vec<String> = sqlx::query_scalar(
        "SELECT s.scheme || '://' || s.urn FROM sources s \
         JOIN compilation_sources m ON m.source_id = s.id \
         WHERE m.compilation_id = ? ORDER BY s.id",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;
    Ok(Some((compilation, urls)))
}

#[instrument(skip_all)]
pub async fn update_compilation(pool: &Pool, id: &str, changes: &CompilationChanges<'_>) -> Result<()> {
    let mut tx = pool.begin().await?;
    for source_id in changes.add_sources {
        sqlx::query(
            "INSERT OR IGNORE INTO compilation_sources (compilation_id, source_id) VALUES (?, ?)",
        )
        .bind(id)
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
    }
    for source_id in changes.delete_sources {
        sqlx::query("DELETE FROM compilation_sources WHERE compilation_id = ? AND source_id = ?")
            .bind(id)
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
    }
    if let Some(password) = changes.password {
        sqlx::query("UPDATE compilations SET password = ? WHERE id = ?")
            .bind(password)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    if let Some(name) = changes.name {
        sqlx::query("UPDATE compilations SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    if let Some(include) = changes.filter_include {
        sqlx::query("UPDATE compilations SET filter_include = ? WHERE id = ?")
            .bind(include)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    if let Some(exclude) = changes.filter_exclude {
        sqlx::query("UPDATE compilations SET filter_exclude = ? WHERE id = ?")
            .bind(exclude)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_compilation(pool: &Pool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM compilation_sources WHERE compilation_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM compilation_status WHERE compilation_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query("DELETE FROM compilations WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected() == 1)
}

/// Remove sources that no compilation references any more.
#[instrument(skip_all)]
pub async fn delete_orphan_sources(pool: &Pool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM source_status WHERE source_id NOT IN (SELECT source_id FROM compilation_sources)",
    )
    .execute(&mut *tx)
    .await?;
    let res = sqlx::query(
        "DELETE FROM sources WHERE id NOT IN (SELECT source_id FROM compilation_sources)",
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}
