//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows and view models returned by repositories.
//! - `repo`: SQL-only functions, including the watermark comparisons that
//!   decide which sources and compilations each stage works on.
//!
//! External modules should import from `rssmix::db`; the repository API and
//! the commonly used models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{
    CompilationForMerge, CompilationStatus, FetchableSource, PublishCandidate, SourceStatus,
};
