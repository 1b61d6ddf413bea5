//! Watermark-driven RSS/Atom aggregation.
//!
//! Three stages share one SQLite database and never call each other:
//! - [`fetcher`] keeps a local cache of every source and bumps the source's
//!   `updated` watermark when new content arrives;
//! - [`compiler`] re-merges every compilation with a member newer than the
//!   compilation's own `updated` watermark;
//! - [`publisher`] hands every artifact whose `updated` is past its
//!   `published` watermark to an external command.
//!
//! [`catalog`] writes the compilations and sources the stages read.

pub mod cache;
pub mod catalog;
pub mod clock;
pub mod compiler;
pub mod config;
pub mod context;
pub mod db;
pub mod fetcher;
pub mod filter;
pub mod http;
pub mod model;
pub mod publisher;
pub mod scheduler;
