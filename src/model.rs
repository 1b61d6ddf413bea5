use chrono::{DateTime, Utc};
use feed_rs::model::Entry;

/// One entry of a source feed, normalized for merging. Rebuilt on every
/// merge pass and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<Author>,
    pub enclosure: Option<Enclosure>,
    pub link: Option<String>,
    /// Update time if the entry has one, otherwise publish time.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: Option<String>,
}

impl Author {
    /// RSS 2.0 wants an address; fall back to the bare name without one.
    pub fn to_rss(&self) -> String {
        match &self.email {
            Some(email) if self.name.is_empty() => email.clone(),
            Some(email) => format!("{} ({})", email, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclosure {
    pub url: String,
    pub length: Option<u64>,
    pub mime_type: Option<String>,
}

impl FeedItem {
    pub fn from_entry(entry: Entry) -> Self {
        let link = entry
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .or_else(|| entry.links.first())
            .map(|l| l.href.clone());

        let enclosure = entry
            .media
            .iter()
            .flat_map(|m| m.content.iter())
            .find_map(|c| {
                c.url.as_ref().map(|url| Enclosure {
                    url: url.to_string(),
                    length: c.size,
                    mime_type: c.content_type.as_ref().map(|m| m.to_string()),
                })
            })
            .or_else(|| {
                entry
                    .links
                    .iter()
                    .find(|l| l.rel.as_deref() == Some("enclosure"))
                    .map(|l| Enclosure {
                        url: l.href.clone(),
                        length: l.length,
                        mime_type: l.media_type.clone(),
                    })
            });

        let author = entry.authors.first().map(|p| Author {
            name: p.name.clone(),
            email: p.email.clone(),
        });

        FeedItem {
            id: entry.id,
            title: entry.title.map(|t| t.content).unwrap_or_default(),
            description: entry.summary.map(|s| s.content),
            content: entry.content.and_then(|c| c.body),
            author,
            enclosure,
            link,
            timestamp: entry.updated.or(entry.published),
        }
    }
}
