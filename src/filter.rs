//! Title filters of a compilation.
//!
//! Filters are stored as comma-joined regular expressions. Patterns that do
//! not compile are dropped one by one; the rest of the list still applies.
use regex::Regex;
use tracing::warn;

/// Compile a comma-joined pattern list, skipping empty and invalid entries.
pub fn parse_patterns(joined: &str) -> Vec<Regex> {
    joined
        .split(',')
        .filter(|p| !p.is_empty())
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!(pattern = p, %err, "dropping invalid filter pattern");
                None
            }
        })
        .collect()
}

fn match_any(title: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|re| re.is_match(title))
}

#[derive(Debug, Clone, Default)]
pub struct TitleFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TitleFilter {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Self {
        Self {
            include: include.map(parse_patterns).unwrap_or_default(),
            exclude: exclude.map(parse_patterns).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Whether an item with this title goes into the compilation.
    ///
    /// An include match keeps the item even when an exclude pattern also
    /// matches; exclude only decides items no include pattern claimed.
    pub fn keeps(&self, title: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        if !self.include.is_empty() && match_any(title, &self.include) {
            return true;
        }
        !self.exclude.is_empty() && !match_any(title, &self.exclude)
    }
}
