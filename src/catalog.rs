//! Compilation and source management over the shared store.
//!
//! This is the storage side of the management surface: the pipeline stages
//! only read what these functions write.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument};
use url::Url;

use crate::cache::sharded;
use crate::config::Public;
use crate::context::AppContext;
use crate::db;
use crate::db::{CompilationChanges, NewCompilationRow, Pool};

/// Characters used for compilation ids; look-alikes (i, l, o, 0, 1) are left out.
pub const ID_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

pub const MAX_NAME_LEN: usize = 127;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid source url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("compilation {0} not found")]
    NotFound(String),
    #[error("compilation is password protected")]
    PasswordRequired,
    #[error("wrong password")]
    WrongPassword,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A source URL split the way it is stored: scheme, and host plus path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    pub scheme: String,
    pub urn: String,
}

impl NormalizedUrl {
    pub fn as_url(&self) -> String {
        format!("{}://{}", self.scheme, self.urn)
    }
}

/// Normalize a user-supplied feed URL. A missing scheme defaults to http;
/// query string and fragment are dropped.
pub fn normalize_source_url(raw: &str) -> Result<NormalizedUrl, CatalogError> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let invalid = |reason: String| CatalogError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host".into()))?
        .to_lowercase();

    let mut urn = host;
    if let Some(port) = url.port() {
        urn.push(':');
        urn.push_str(&port.to_string());
    }
    urn.push_str(url.path());

    Ok(NormalizedUrl {
        scheme: url.scheme().to_lowercase(),
        urn,
    })
}

/// Random id drawn from [`ID_ALPHABET`].
pub fn generate_id(length: usize) -> String {
    let mut out = String::with_capacity(length);
    while out.len() < length {
        for byte in uuid::Uuid::new_v4().into_bytes() {
            if out.len() == length {
                break;
            }
            // 248 is the largest multiple of 31 below 256; rejecting the rest
            // keeps the draw uniform.
            if byte < 248 {
                out.push(ID_ALPHABET[byte as usize % ID_ALPHABET.len()] as char);
            }
        }
    }
    out
}

/// Truncate to at most [`MAX_NAME_LEN`] characters.
pub fn bounded_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LEN).collect()
}

fn relative_artifact(public: &Public, id: &str) -> PathBuf {
    sharded(id, public.subdirs).with_file_name(format!("{}.rss", id))
}

/// `{protocol}://{hostname}/{a/b/}{id}.rss`
pub fn public_url(public: &Public, id: &str) -> String {
    let rel = relative_artifact(public, id);
    let rel = rel
        .iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}://{}/{}", public.protocol, public.hostname, rel)
}

pub fn output_path(public: &Public, id: &str) -> PathBuf {
    Path::new(&public.output_dir).join(relative_artifact(public, id))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCompilation {
    pub name: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub filter_include: Option<String>,
    #[serde(default)]
    pub filter_exclude: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedCompilation {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationView {
    pub id: String,
    pub name: String,
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_include: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_exclude: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

/// Edits to an existing compilation. Empty fields leave things unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Changeset {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub delete: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub filter_include: Option<String>,
    #[serde(default)]
    pub filter_exclude: Option<String>,
}

/// Find the source for `raw`, creating it on first reference.
pub async fn find_or_create_source(ctx: &AppContext, raw: &str) -> Result<i64, CatalogError> {
    let url = normalize_source_url(raw)?;
    if let Some(id) = db::find_source_id(&ctx.pool, &url.scheme, &url.urn).await? {
        return Ok(id);
    }
    let id = db::insert_source(&ctx.pool, &url.scheme, &url.urn, ctx.clock.now()).await?;
    info!(source_id = id, url = %url.as_url(), "new source");
    Ok(id)
}

#[instrument(skip_all)]
pub async fn create_compilation(
    ctx: &AppContext,
    new: &NewCompilation,
) -> Result<CreatedCompilation, CatalogError> {
    // Validate every URL before creating anything.
    for raw in &new.urls {
        normalize_source_url(raw)?;
    }
    let mut source_ids = Vec::with_capacity(new.urls.len());
    for raw in &new.urls {
        source_ids.push(find_or_create_source(ctx, raw).await?);
    }

    let public = &ctx.config.public;
    let mut id = generate_id(public.id_length);
    while db::compilation_exists(&ctx.pool, &id).await? {
        id = generate_id(public.id_length);
    }

    let name = bounded_name(&new.name);
    let url = public_url(public, &id);
    let output = output_path(public, &id);
    let output = output.to_string_lossy();
    let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
    let password = non_empty(&new.password);
    let include = non_empty(&new.filter_include);
    let exclude = non_empty(&new.filter_exclude);

    let row = NewCompilationRow {
        id: &id,
        name: &name,
        password: password.as_deref(),
        filter_include: include.as_deref(),
        filter_exclude: exclude.as_deref(),
        output_path: &output,
        public_url: &url,
    };
    db::insert_compilation(&ctx.pool, &row, &source_ids, ctx.clock.now()).await?;
    info!(compilation = %id, sources = source_ids.len(), "new compilation");
    Ok(CreatedCompilation { id, url })
}

pub async fn get_compilation(pool: &Pool, id: &str) -> Result<CompilationView, CatalogError> {
    let (compilation, urls) = db::compilation_details(pool, id)
        .await?
        .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
    Ok(CompilationView {
        id: compilation.id,
        name: compilation.name,
        urls,
        filter_include: compilation.filter_include,
        filter_exclude: compilation.filter_exclude,
        public_url: compilation.public_url,
    })
}

/// A password, once set, must be presented for any change.
async fn check_password(pool: &Pool, id: &str, given: Option<&str>) -> Result<(), CatalogError> {
    let stored = db::compilation_password(pool, id)
        .await?
        .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
    let Some(stored) = stored else {
        return Ok(());
    };
    match given.filter(|g| !g.is_empty()) {
        None => Err(CatalogError::PasswordRequired),
        Some(g) if g == stored => Ok(()),
        Some(_) => Err(CatalogError::WrongPassword),
    }
}

#[instrument(skip_all, fields(compilation = id))]
pub async fn update_compilation(
    ctx: &AppContext,
    id: &str,
    password: Option<&str>,
    changes: &Changeset,
) -> Result<(), CatalogError> {
    check_password(&ctx.pool, id, password).await?;

    for raw in &changes.add {
        normalize_source_url(raw)?;
    }
    let mut add = Vec::with_capacity(changes.add.len());
    for raw in &changes.add {
        add.push(find_or_create_source(ctx, raw).await?);
    }
    // Removing a URL that was never tracked is a no-op.
    let mut delete = Vec::with_capacity(changes.delete.len());
    for raw in &changes.delete {
        let url = normalize_source_url(raw)?;
        if let Some(sid) = db::find_source_id(&ctx.pool, &url.scheme, &url.urn).await? {
            delete.push(sid);
        }
    }

    let name = changes
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .map(bounded_name);
    let db_changes = CompilationChanges {
        add_sources: &add,
        delete_sources: &delete,
        password: changes.password.as_deref().filter(|p| !p.is_empty()),
        name: name.as_deref(),
        filter_include: changes.filter_include.as_deref(),
        filter_exclude: changes.filter_exclude.as_deref(),
    };
    db::update_compilation(&ctx.pool, id, &db_changes).await?;
    info!(added = add.len(), removed = delete.len(), "compilation changed");
    Ok(())
}

#[instrument(skip_all, fields(compilation = id))]
pub async fn delete_compilation(
    pool: &Pool,
    id: &str,
    password: Option<&str>,
) -> Result<(), CatalogError> {
    check_password(pool, id, password).await?;
    if !db::delete_compilation(pool, id).await? {
        return Err(CatalogError::NotFound(id.to_string()));
    }
    info!("compilation deleted");
    Ok(())
}

pub async fn cleanup_orphan_sources(pool: &Pool) -> Result<u64, CatalogError> {
    let deleted = db::delete_orphan_sources(pool).await?;
    info!(deleted, "orphan sources removed");
    Ok(deleted)
}
