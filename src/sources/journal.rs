//! Journal table-of-contents feeds (RSS 2.0 with Dublin Core / PRISM).
//!
//! Publishers expose recent issues as RSS. Items carry a DOI in
//! `prism:doi` (sometimes `dc:identifier`), authors in `dc:creator`, and the
//! PDF either as an `enclosure` or only as the item `link`. Long feeds
//! paginate with `<atom:link rel="next" href="..."/>`.
//!
//! The window filter runs client-side: feeds have no query language.

use chrono::{DateTime, NaiveDate, Utc};
use paper_harvest_core::models::{DocumentDescriptor, OriginType};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::json;

use super::{Page, PageRequest};
use crate::config::JournalSourceConfig;
use crate::error::{HarvestError, HarvestResult};
use crate::throttle::MinIntervalThrottle;

#[derive(Debug)]
pub struct JournalSource {
    name: String,
    feed_url: String,
    category: Option<String>,
    label: String,
    throttle: MinIntervalThrottle,
}

impl JournalSource {
    pub fn new(config: &JournalSourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            feed_url: config.feed_url.clone(),
            category: config.category.clone(),
            label: format!("journal:{}", config.name),
            throttle: MinIntervalThrottle::new(std::time::Duration::from_millis(
                config.min_request_interval_ms,
            )),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn throttle(&self) -> &MinIntervalThrottle {
        &self.throttle
    }

    pub fn first_request(&self) -> PageRequest {
        PageRequest {
            url: self.feed_url.clone(),
            offset: 0,
        }
    }

    pub fn parse_page(&self, body: &str, request: &PageRequest) -> HarvestResult<Page> {
        let (items, next_url) = parse_rss(body)?;
        let mut descriptors = Vec::with_capacity(items.len());
        for item in items {
            match item.into_descriptor(self) {
                Ok(d) => descriptors.push(d),
                Err(err) => tracing::warn!(journal = %self.name, error = %err, "skipping feed item"),
            }
        }
        // A feed that links back to the page we just read would loop forever.
        let next = next_url
            .filter(|url| url != &request.url && !descriptors.is_empty())
            .map(|url| PageRequest {
                url,
                offset: request.offset + descriptors.len(),
            });
        Ok(Page {
            descriptors,
            next,
            total: None,
        })
    }
}

#[derive(Debug, Default)]
struct FeedItem {
    title: String,
    link: String,
    guid: String,
    pub_date: String,
    dc_date: String,
    creators: Vec<String>,
    doi: Option<String>,
    enclosure_pdf: Option<String>,
    categories: Vec<String>,
    description: String,
}

impl FeedItem {
    fn published(&self) -> Option<DateTime<Utc>> {
        parse_feed_date(&self.pub_date).or_else(|| parse_feed_date(&self.dc_date))
    }

    fn into_descriptor(self, source: &JournalSource) -> HarvestResult<DocumentDescriptor> {
        let published = self.published().ok_or_else(|| {
            HarvestError::Content(format!("item '{}' has no usable date", self.title.trim()))
        })?;

        let id = match &self.doi {
            Some(doi) => format!("doi:{}", doi.to_lowercase()),
            None => {
                let key = if !self.guid.trim().is_empty() {
                    self.guid.trim()
                } else {
                    self.link.trim()
                };
                if key.is_empty() {
                    return Err(HarvestError::Content(format!(
                        "item '{}' has neither DOI, guid, nor link",
                        self.title.trim()
                    )));
                }
                format!("{}:{}", source.name, key)
            }
        };

        let url = self
            .enclosure_pdf
            .clone()
            .unwrap_or_else(|| self.link.trim().to_string());
        if url.is_empty() {
            return Err(HarvestError::Content(format!("item {} has no retrieval URL", id)));
        }

        let mut categories = self.categories;
        if let Some(cat) = &source.category {
            if !categories.contains(cat) {
                categories.insert(0, cat.clone());
            }
        }

        Ok(DocumentDescriptor {
            id,
            origin: OriginType::Journal,
            source: source.label.clone(),
            title: collapse_ws(&self.title),
            authors: self.creators,
            published,
            url,
            categories,
            metadata: json!({
                "journal": source.name,
                "doi": self.doi,
                "guid": self.guid.trim(),
                "link": self.link.trim(),
                "description": collapse_ws(&self.description),
            }),
        })
    }
}

/// RSS dates are RFC 2822; Dublin Core dates are RFC 3339 or plain dates.
pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        })
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn push_spaced(buf: &mut String, text: &str) {
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(text);
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Returns the items and the `rel="next"` link, if any.
fn parse_rss(body: &str) -> HarvestResult<(Vec<FeedItem>, Option<String>)> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut next = None;
    let mut item: Option<FeedItem> = None;
    // Qualified name of the innermost open element, e.g. `dc:creator`.
    let mut stack: Vec<Vec<u8>> = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| {
            HarvestError::Content(format!(
                "journal feed at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;
        match event {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"item" {
                    item = Some(FeedItem::default());
                }
                handle_element(&e, &mut item, &mut next);
                stack.push(e.name().as_ref().to_vec());
            }
            Event::Empty(e) => handle_element(&e, &mut item, &mut next),
            Event::End(e) => {
                stack.pop();
                if e.local_name().as_ref() == b"item" {
                    if let Some(done) = item.take() {
                        items.push(done);
                    }
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| HarvestError::Content(format!("journal feed: {}", e)))?;
                apply_text(&stack, &text, &mut item);
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                apply_text(&stack, &text, &mut item);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok((items, next))
}

fn handle_element(e: &BytesStart<'_>, item: &mut Option<FeedItem>, next: &mut Option<String>) {
    match e.local_name().as_ref() {
        b"link" => {
            if attr(e, b"rel").as_deref() == Some("next") {
                if let Some(href) = attr(e, b"href") {
                    *next = Some(href);
                }
            }
        }
        b"enclosure" => {
            if let Some(item) = item.as_mut() {
                let is_pdf = attr(e, b"type").is_some_and(|t| t.contains("pdf"));
                if is_pdf {
                    item.enclosure_pdf = attr(e, b"url");
                }
            }
        }
        _ => {}
    }
}

fn apply_text(stack: &[Vec<u8>], text: &str, item: &mut Option<FeedItem>) {
    let (Some(item), Some(current)) = (item.as_mut(), stack.last()) else {
        return;
    };
    match current.as_slice() {
        b"title" | b"dc:title" => push_spaced(&mut item.title, text),
        b"link" => item.link.push_str(text),
        b"guid" => item.guid.push_str(text),
        b"pubDate" => item.pub_date.push_str(text),
        b"dc:date" | b"prism:publicationDate" => item.dc_date.push_str(text),
        b"dc:creator" | b"author" => item.creators.push(collapse_ws(text)),
        b"prism:doi" => item.doi = Some(text.trim().to_string()),
        b"dc:identifier" => {
            let t = text.trim();
            if item.doi.is_none() {
                if let Some(doi) = t.strip_prefix("doi:") {
                    item.doi = Some(doi.to_string());
                }
            }
        }
        b"category" => item.categories.push(text.trim().to_string()),
        b"description" => push_spaced(&mut item.description, text),
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/"
     xmlns:prism="http://prismstandard.org/namespaces/basic/2.0/"
     xmlns:atom="http://www.w3.org/2005/Atom">
<channel>
  <title>Journal of Optics</title>
  <link>https://example.org/joo</link>
  <atom:link rel="next" href="https://example.org/joo.rss?page=2"/>
  <item>
    <title>Slow light in <![CDATA[photonic]]> crystals</title>
    <link>https://example.org/joo/article/1</link>
    <guid>https://example.org/joo/article/1</guid>
    <pubDate>Wed, 10 Jan 2024 00:00:00 GMT</pubDate>
    <dc:creator>Grace Hopper</dc:creator>
    <dc:creator>Lise Meitner</dc:creator>
    <prism:doi>10.1364/JOO.2024.001</prism:doi>
    <enclosure url="https://example.org/joo/article/1.pdf" type="application/pdf" length="1024"/>
  </item>
  <item>
    <title>Errata</title>
    <link>https://example.org/joo/article/2</link>
    <guid isPermaLink="false">joo-2</guid>
    <dc:date>2024-01-12</dc:date>
  </item>
  <item>
    <title>Undated editorial</title>
    <link>https://example.org/joo/article/3</link>
  </item>
</channel>
</rss>"#;

    fn source() -> JournalSource {
        JournalSource::new(&JournalSourceConfig {
            name: "joo".into(),
            feed_url: "https://example.org/joo.rss".into(),
            category: Some("physics.optics".into()),
            min_request_interval_ms: 0,
        })
    }

    #[test]
    fn parses_items_and_next_link() {
        let src = source();
        let page = src.parse_page(FEED, &src.first_request()).unwrap();
        assert_eq!(page.descriptors.len(), 2, "undated item is skipped");

        let first = &page.descriptors[0];
        assert_eq!(first.id, "doi:10.1364/joo.2024.001");
        assert_eq!(first.title, "Slow light in photonic crystals");
        assert_eq!(first.url, "https://example.org/joo/article/1.pdf");
        assert_eq!(first.authors, vec!["Grace Hopper", "Lise Meitner"]);
        assert_eq!(first.origin, OriginType::Journal);
        assert_eq!(first.source, "journal:joo");
        assert_eq!(first.categories, vec!["physics.optics"]);

        let second = &page.descriptors[1];
        assert_eq!(second.id, "joo:joo-2");
        assert_eq!(second.url, "https://example.org/joo/article/2");

        let next = page.next.unwrap();
        assert_eq!(next.url, "https://example.org/joo.rss?page=2");
        assert_eq!(next.offset, 2);
    }

    #[test]
    fn self_referencing_next_link_ends_paging() {
        let src = source();
        let looped = FEED.replace("joo.rss?page=2", "joo.rss");
        let page = src.parse_page(&looped, &src.first_request()).unwrap();
        assert!(page.next.is_none());
    }

    #[test]
    fn feed_dates() {
        assert!(parse_feed_date("Wed, 10 Jan 2024 00:00:00 GMT").is_some());
        assert!(parse_feed_date("2024-01-10T12:00:00+02:00").is_some());
        assert!(parse_feed_date("2024-01-10").is_some());
        assert!(parse_feed_date("next tuesday").is_none());
    }

    #[test]
    fn broken_feed_is_a_content_error() {
        let src = source();
        let err = src
            .parse_page("<rss><channel><item></channel></rss>", &src.first_request())
            .unwrap_err();
        assert!(matches!(err, HarvestError::Content(_)));
    }
}
