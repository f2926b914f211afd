//! Feed document parsing and content signatures.

use crate::error::FetchError;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

/// One entry of a parsed RSS or Atom document
#[derive(Clone, Debug, PartialEq)]
pub struct FeedEntry {
    /// Identity within the feed (guid, falling back to link, then title)
    pub guid: String,
    /// Entry title
    pub title: String,
    /// Primary link
    pub link: Option<String>,
    /// Publication date (Atom falls back to `updated`)
    pub published_at: Option<DateTime<Utc>>,
    /// Description, summary or content
    pub summary: Option<String>,
}

impl FeedEntry {
    /// Normalized representation used for hashing
    fn normalized(&self) -> String {
        let published = self
            .published_at
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        [
            collapse_whitespace(&self.guid),
            collapse_whitespace(&self.title),
            collapse_whitespace(self.link.as_deref().unwrap_or("")),
            published,
        ]
        .join("\u{1f}")
    }

    /// Hash over the entry's normalized fields plus its summary
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.normalized().as_bytes());
        hasher.update([0x1f]);
        hasher.update(collapse_whitespace(self.summary.as_deref().unwrap_or("")).as_bytes());
        hex(&hasher.finalize())
    }
}

/// Parse a feed body, trying RSS 2.0 first and Atom second
pub fn parse_feed(content: &str) -> Result<Vec<FeedEntry>, FetchError> {
    match parse_as_rss(content) {
        Ok(entries) => {
            debug!(entries = entries.len(), "parsed feed as RSS");
            Ok(entries)
        }
        Err(rss_err) => {
            debug!(error = %rss_err, "not an RSS document, trying Atom");
            match parse_as_atom(content) {
                Ok(entries) => {
                    debug!(entries = entries.len(), "parsed feed as Atom");
                    Ok(entries)
                }
                Err(atom_err) => Err(FetchError::Parse(format!(
                    "not RSS ({}) or Atom ({})",
                    rss_err, atom_err
                ))),
            }
        }
    }
}

fn parse_as_rss(content: &str) -> Result<Vec<FeedEntry>, rss::Error> {
    let channel = content.parse::<rss::Channel>()?;

    let entries = channel
        .items()
        .iter()
        .map(|item| {
            let guid = item
                .guid()
                .map(|g| g.value().to_string())
                .or_else(|| item.link().map(|l| l.to_string()))
                .unwrap_or_else(|| item.title().unwrap_or("").to_string());

            let published_at = item.pub_date().and_then(|date_str| {
                DateTime::parse_from_rfc2822(date_str)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            });

            FeedEntry {
                guid,
                title: item.title().unwrap_or("").to_string(),
                link: item.link().map(|l| l.to_string()),
                published_at,
                summary: item.description().map(|d| d.to_string()),
            }
        })
        .collect();

    Ok(entries)
}

fn parse_as_atom(content: &str) -> Result<Vec<FeedEntry>, atom_syndication::Error> {
    let feed = atom_syndication::Feed::read_from(content.as_bytes())?;

    let entries = feed
        .entries()
        .iter()
        .map(|entry| {
            let published_at = entry
                .published()
                .or_else(|| Some(entry.updated()))
                .and_then(|dt| {
                    DateTime::parse_from_rfc3339(&dt.to_rfc3339())
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc))
                });

            let summary = entry.summary().map(|s| s.as_str().to_string()).or_else(|| {
                entry
                    .content()
                    .and_then(|c| c.value().map(|v| v.to_string()))
            });

            FeedEntry {
                guid: entry.id().to_string(),
                title: entry.title().as_str().to_string(),
                link: entry.links().first().map(|link| link.href().to_string()),
                published_at,
                summary,
            }
        })
        .collect();

    Ok(entries)
}

/// Order-independent hash over all entries of a document
///
/// Two documents with the same entries in a different order, or differing
/// only in whitespace, produce the same signature.
pub fn content_signature(entries: &[FeedEntry]) -> String {
    let mut normalized: Vec<(String, String)> = entries
        .iter()
        .map(|entry| (collapse_whitespace(&entry.guid), entry.normalized()))
        .collect();
    normalized.sort();

    let mut hasher = Sha256::new();
    for (_, line) in &normalized {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex(&hasher.finalize())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>https://example.com</link>
    <description>Example feed</description>
    <item>
      <title>First   post</title>
      <link>https://example.com/1</link>
      <guid>post-1</guid>
      <pubDate>Tue, 14 Nov 2023 22:13:20 +0000</pubDate>
    </item>
    <item>
      <title>Second post</title>
      <link>https://example.com/2</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example</title>
  <id>urn:example</id>
  <updated>2023-11-14T22:13:20Z</updated>
  <entry>
    <title>Atom entry</title>
    <id>urn:entry:1</id>
    <updated>2023-11-14T22:13:20Z</updated>
    <link href="https://example.com/a"/>
    <summary>Hello</summary>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_items_with_guid_fallback() {
        let entries = parse_feed(RSS).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].guid, "post-1");
        assert_eq!(
            entries[0].published_at.unwrap().timestamp(),
            1_700_000_000
        );
        // Without a guid the link identifies the entry
        assert_eq!(entries[1].guid, "https://example.com/2");
    }

    #[test]
    fn falls_back_to_atom() {
        let entries = parse_feed(ATOM).unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].guid, "urn:entry:1");
        assert_eq!(entries[0].link.as_deref(), Some("https://example.com/a"));
        assert_eq!(entries[0].summary.as_deref(), Some("Hello"));
        assert!(entries[0].published_at.is_some());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_feed("<html><body>not a feed</body></html>").unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn signature_ignores_order_and_whitespace() {
        let mut entries = parse_feed(RSS).unwrap();
        let original = content_signature(&entries);

        entries.reverse();
        entries[1].title = "First post".to_string();
        assert_eq!(content_signature(&entries), original);

        entries[0].title = "Second post (edited)".to_string();
        assert_ne!(content_signature(&entries), original);
    }

    #[test]
    fn content_hash_tracks_summary() {
        let entry = FeedEntry {
            guid: "g".into(),
            title: "t".into(),
            link: None,
            published_at: None,
            summary: Some("one".into()),
        };
        let mut edited = entry.clone();
        edited.summary = Some("two".into());

        assert_ne!(entry.content_hash(), edited.content_hash());
        assert_eq!(entry.content_hash().len(), 64);
    }
}
