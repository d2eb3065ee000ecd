//! arXiv-style bulk archive listing (Atom API).
//!
//! One query per discovery run:
//!
//! ```text
//! search_query = (cat:physics.optics OR cat:quant-ph)
//!                AND submittedDate:[202401010000 TO 202401312359]
//! start        = 0, 100, 200, ...
//! max_results  = page_size
//! ```
//!
//! Paging stops when `opensearch:totalResults` is reached or a page comes
//! back empty. Ids are normalized to `arxiv:<id>` with the version suffix
//! stripped, so `2401.01234v1` and `2401.01234v3` are the same document.

use chrono::{DateTime, Utc};
use paper_harvest_core::models::{DocumentDescriptor, OriginType};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::json;

use super::{DateWindow, Page, PageRequest};
use crate::config::ArchiveSourceConfig;
use crate::error::{HarvestError, HarvestResult};
use crate::throttle::MinIntervalThrottle;

const SOURCE_LABEL: &str = "archive:arxiv";

#[derive(Debug)]
pub struct ArchiveSource {
    base_url: String,
    categories: Vec<String>,
    page_size: usize,
    throttle: MinIntervalThrottle,
}

impl ArchiveSource {
    pub fn new(config: &ArchiveSourceConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            categories: config.categories.clone(),
            page_size: config.page_size,
            throttle: MinIntervalThrottle::new(std::time::Duration::from_millis(
                config.min_request_interval_ms,
            )),
        }
    }

    pub fn label(&self) -> &'static str {
        SOURCE_LABEL
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn throttle(&self) -> &MinIntervalThrottle {
        &self.throttle
    }

    pub fn search_query(&self, window: &DateWindow) -> String {
        let cats = self
            .categories
            .iter()
            .map(|c| format!("cat:{}", c))
            .collect::<Vec<_>>()
            .join(" OR ");
        format!(
            "({}) AND submittedDate:[{} TO {}]",
            cats,
            window.from.format("%Y%m%d%H%M"),
            window.until.format("%Y%m%d%H%M")
        )
    }

    pub fn page_request(&self, window: &DateWindow, offset: usize) -> HarvestResult<PageRequest> {
        let url = reqwest::Url::parse_with_params(
            &self.base_url,
            &[
                ("search_query", self.search_query(window)),
                ("start", offset.to_string()),
                ("max_results", self.page_size.to_string()),
                ("sortBy", "submittedDate".to_string()),
                ("sortOrder", "ascending".to_string()),
            ],
        )
        .map_err(|e| {
            HarvestError::Configuration(format!("invalid archive base_url {}: {}", self.base_url, e))
        })?;
        Ok(PageRequest {
            url: url.to_string(),
            offset,
        })
    }

    pub fn parse_page(
        &self,
        body: &str,
        request: &PageRequest,
        window: &DateWindow,
    ) -> HarvestResult<Page> {
        let feed = parse_feed(body)?;
        let returned = feed.entries.len();
        let next_offset = request.offset + returned;
        let more = returned > 0 && feed.total.map_or(returned >= self.page_size, |t| next_offset < t);
        let next = if more {
            Some(self.page_request(window, next_offset)?)
        } else {
            None
        };
        Ok(Page {
            descriptors: feed.entries,
            next,
            total: feed.total,
        })
    }
}

#[derive(Debug, Default)]
pub struct ArchiveFeed {
    pub total: Option<usize>,
    pub entries: Vec<DocumentDescriptor>,
}

#[derive(Debug, Default)]
struct EntryBuilder {
    raw_id: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    categories: Vec<String>,
    primary_category: Option<String>,
    pdf_url: Option<String>,
    doi: Option<String>,
}

impl EntryBuilder {
    fn api_error(&self) -> Option<HarvestError> {
        self.raw_id.contains("/api/errors").then(|| {
            HarvestError::Content(format!("archive API error: {}", collapse_ws(&self.summary)))
        })
    }

    fn build(self) -> HarvestResult<DocumentDescriptor> {
        let versioned = self
            .raw_id
            .rsplit_once("/abs/")
            .map(|(_, id)| id)
            .unwrap_or(self.raw_id.as_str())
            .trim()
            .to_string();
        if versioned.is_empty() {
            return Err(HarvestError::Content("archive entry without id".into()));
        }
        let id = strip_version(&versioned);
        let published = DateTime::parse_from_rfc3339(self.published.trim())
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| {
                HarvestError::Content(format!("entry {} has bad published date: {}", id, e))
            })?;

        let url = self
            .pdf_url
            .unwrap_or_else(|| format!("https://arxiv.org/pdf/{}", versioned));

        let mut categories = self.categories;
        if let Some(primary) = &self.primary_category {
            if !categories.contains(primary) {
                categories.insert(0, primary.clone());
            }
        }

        Ok(DocumentDescriptor {
            id: format!("arxiv:{}", id),
            origin: OriginType::Archive,
            source: SOURCE_LABEL.to_string(),
            title: collapse_ws(&self.title),
            authors: self.authors,
            published,
            url,
            categories,
            metadata: json!({
                "arxiv_id": versioned,
                "abstract": collapse_ws(&self.summary),
                "primary_category": self.primary_category,
                "doi": self.doi,
            }),
        })
    }
}

/// `2401.01234v2` → `2401.01234`; `hep-th/9901001v1` → `hep-th/9901001`.
pub fn strip_version(id: &str) -> String {
    if let Some(pos) = id.rfind('v') {
        let (head, tail) = id.split_at(pos);
        if !head.is_empty() && tail.len() > 1 && tail[1..].chars().all(|c| c.is_ascii_digit()) {
            return head.to_string();
        }
    }
    id.to_string()
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn handle_element(e: &BytesStart<'_>, entry: &mut Option<EntryBuilder>) {
    let Some(entry) = entry.as_mut() else {
        return;
    };
    match e.local_name().as_ref() {
        b"link" => {
            let is_pdf = attr(e, b"title").as_deref() == Some("pdf")
                || attr(e, b"type").as_deref() == Some("application/pdf");
            if is_pdf {
                entry.pdf_url = attr(e, b"href");
            }
        }
        b"category" => {
            if let Some(term) = attr(e, b"term") {
                if !entry.categories.contains(&term) {
                    entry.categories.push(term);
                }
            }
        }
        b"primary_category" => entry.primary_category = attr(e, b"term"),
        _ => {}
    }
}

/// Parse one Atom page. Malformed XML is a [`HarvestError::Content`] error;
/// a single malformed entry is skipped with a warning.
pub fn parse_feed(body: &str) -> HarvestResult<ArchiveFeed> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut feed = ArchiveFeed::default();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut entry: Option<EntryBuilder> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"entry" {
                    entry = Some(EntryBuilder::default());
                }
                handle_element(&e, &mut entry);
                stack.push(name);
            }
            Ok(Event::Empty(e)) => handle_element(&e, &mut entry),
            Ok(Event::End(e)) => {
                stack.pop();
                if e.local_name().as_ref() == b"entry" {
                    if let Some(done) = entry.take() {
                        if let Some(err) = done.api_error() {
                            return Err(err);
                        }
                        match done.build() {
                            Ok(descriptor) => feed.entries.push(descriptor),
                            Err(err) => tracing::warn!(error = %err, "skipping archive entry"),
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| HarvestError::Content(format!("archive feed: {}", e)))?;
                apply_text(&stack, &text, &mut feed, &mut entry);
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                apply_text(&stack, &text, &mut feed, &mut entry);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(HarvestError::Content(format!(
                    "archive feed at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(feed)
}

fn apply_text(
    stack: &[Vec<u8>],
    text: &str,
    feed: &mut ArchiveFeed,
    entry: &mut Option<EntryBuilder>,
) {
    let Some(current) = stack.last() else {
        return;
    };
    let in_author = stack.len() >= 2 && stack[stack.len() - 2] == b"author";
    match (entry.as_mut(), current.as_slice()) {
        (None, b"totalResults") => feed.total = text.trim().parse().ok(),
        (Some(e), b"id") => e.raw_id.push_str(text),
        (Some(e), b"title") => e.title.push_str(text),
        (Some(e), b"summary") => e.summary.push_str(text),
        (Some(e), b"published") => e.published.push_str(text),
        (Some(e), b"doi") => e.doi = Some(text.trim().to_string()),
        (Some(e), b"name") if in_author => e.authors.push(collapse_ws(text)),
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn entry_xml(id: &str, published: &str, category: &str) -> String {
        format!(
            r#"<entry>
    <id>http://arxiv.org/abs/{id}v2</id>
    <published>{published}</published>
    <title>On the   optics of
      {id}</title>
    <summary>Abstract &amp; results.</summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Emmy Noether</name></author>
    <arxiv:doi xmlns:arxiv="http://arxiv.org/schemas/atom">10.1000/{id}</arxiv:doi>
    <link href="http://arxiv.org/abs/{id}v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/{id}v2" rel="related" type="application/pdf"/>
    <arxiv:primary_category xmlns:arxiv="http://arxiv.org/schemas/atom" term="{category}"/>
    <category term="{category}" scheme="http://arxiv.org/schemas/atom"/>
  </entry>"#
        )
    }

    pub(crate) fn feed_xml(total: usize, entries: &[String]) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/">
  <title>ArXiv Query</title>
  <opensearch:totalResults>{total}</opensearch:totalResults>
  <opensearch:startIndex>0</opensearch:startIndex>
  {}
</feed>"#,
            entries.join("\n")
        )
    }

    fn source() -> ArchiveSource {
        ArchiveSource::new(&ArchiveSourceConfig {
            base_url: "https://export.arxiv.org/api/query".into(),
            categories: vec!["physics.optics".into(), "quant-ph".into()],
            page_size: 2,
            min_request_interval_ms: 0,
        })
    }

    fn january() -> DateWindow {
        DateWindow {
            from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            until: Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap(),
        }
    }

    #[test]
    fn parses_entry_fields() {
        let xml = feed_xml(
            1,
            &[entry_xml("2401.00001", "2024-01-03T18:00:00Z", "physics.optics")],
        );
        let feed = parse_feed(&xml).unwrap();
        assert_eq!(feed.total, Some(1));
        let d = &feed.entries[0];
        assert_eq!(d.id, "arxiv:2401.00001");
        assert_eq!(d.title, "On the optics of 2401.00001");
        assert_eq!(d.authors, vec!["Ada Lovelace", "Emmy Noether"]);
        assert_eq!(d.url, "http://arxiv.org/pdf/2401.00001v2");
        assert_eq!(d.categories, vec!["physics.optics"]);
        assert_eq!(d.metadata["abstract"], "Abstract & results.");
        assert_eq!(d.metadata["doi"], "10.1000/2401.00001");
        assert_eq!(d.origin, OriginType::Archive);
    }

    #[test]
    fn version_suffix_is_stripped() {
        assert_eq!(strip_version("2401.01234v12"), "2401.01234");
        assert_eq!(strip_version("hep-th/9901001v1"), "hep-th/9901001");
        assert_eq!(strip_version("2401.01234"), "2401.01234");
        assert_eq!(strip_version("solv-int/9901001"), "solv-int/9901001");
    }

    #[test]
    fn api_error_entry_is_a_content_error() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <id>http://arxiv.org/api/errors#incorrect_id_format</id>
    <title>Error</title>
    <summary>incorrect id format</summary>
  </entry>
</feed>"#;
        let err = parse_feed(xml).unwrap_err();
        assert!(matches!(err, HarvestError::Content(_)));
    }

    #[test]
    fn malformed_xml_is_a_content_error() {
        let err = parse_feed("<feed><entry><id>x</feed>").unwrap_err();
        assert!(matches!(err, HarvestError::Content(_)));
    }

    #[test]
    fn query_combines_categories_and_window() {
        let q = source().search_query(&january());
        assert_eq!(
            q,
            "(cat:physics.optics OR cat:quant-ph) AND submittedDate:[202401010000 TO 202401312359]"
        );
        let req = source().page_request(&january(), 4).unwrap();
        assert!(req.url.contains("start=4"));
        assert!(req.url.contains("max_results=2"));
    }

    #[test]
    fn paging_stops_at_total() {
        let src = source();
        let entries = vec![
            entry_xml("2401.00001", "2024-01-03T18:00:00Z", "quant-ph"),
            entry_xml("2401.00002", "2024-01-04T18:00:00Z", "quant-ph"),
        ];
        let first = src.page_request(&january(), 0).unwrap();
        let page = src
            .parse_page(&feed_xml(3, &entries), &first, &january())
            .unwrap();
        let next = page.next.unwrap();
        assert_eq!(next.offset, 2);

        let last = src
            .parse_page(&feed_xml(3, &entries[..1]), &next, &january())
            .unwrap();
        assert!(last.next.is_none());
    }
}
