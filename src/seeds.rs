use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::item::DataItem;
use crate::manifest;
use crate::node::NodeInput;

/// Where a workflow's first Node reads from.
#[derive(Debug, Clone, Default)]
pub struct SeedSpec {
    pub urls: Vec<String>,
    pub input_dir: Option<PathBuf>,
    pub sitemap: Option<String>,
    pub sitemap_filter: Option<String>,
}

impl SeedSpec {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.input_dir.is_none() && self.sitemap.is_none()
    }
}

/// Resolve seeds into the initial input. A directory holding `all.json` is an
/// upstream Node output and is passed through; anything else is gathered into
/// a de-duplicated URL list.
pub fn resolve(sources: &SeedSpec) -> Result<NodeInput, PipelineError> {
    if let Some(dir) = &sources.input_dir {
        if manifest::exists(dir) {
            if !sources.urls.is_empty() || sources.sitemap.is_some() {
                return Err(PipelineError::Configuration(
                    "--input_data_dir points at a stage output; it cannot be combined with --url or --sitemap"
                        .into(),
                ));
            }
            return Ok(NodeInput::Directory(dir.clone()));
        }
    }

    let mut urls = sources.urls.clone();
    if let Some(dir) = &sources.input_dir {
        urls.extend(read_url_lists(dir)?);
    }
    if let Some(sitemap) = &sources.sitemap {
        let filter = sources
            .sitemap_filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| PipelineError::Configuration(format!("invalid --sitemap_filter: {}", e)))?;
        urls.extend(fetch_sitemap_urls(sitemap, filter.as_ref())?);
    }

    let items: Vec<DataItem> = urls
        .into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unique()
        .map(DataItem::url)
        .collect();
    info!(count = items.len(), "resolved seed urls");
    Ok(NodeInput::Seeds(items))
}

// ── URL lists ──

/// Read every `*.csv` and `*.txt` file in `dir`, in file-name order.
pub fn read_url_lists(dir: &Path) -> Result<Vec<String>, PipelineError> {
    let entries = fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PipelineError::io(dir, e))?.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if matches!(ext.as_deref(), Some("csv") | Some("txt")) && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let mut urls = Vec::new();
    for path in files {
        let text = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
        let found = if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv")) {
            urls_from_csv(&text)
        } else {
            urls_from_lines(&text)
        };
        info!(file = %path.display(), count = found.len(), "read url list");
        urls.extend(found);
    }
    Ok(urls)
}

/// One URL per line; blank lines and `#` comments skipped.
fn urls_from_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Header row required; uses the `url` column, else the first column.
/// Malformed rows are skipped.
fn urls_from_csv(text: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let col = match reader.headers() {
        Ok(headers) => headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case("url"))
            .unwrap_or(0),
        Err(e) => {
            warn!(error = %e, "unreadable csv header");
            return Vec::new();
        }
    };
    reader
        .records()
        .filter_map(|row| match row {
            Ok(row) => row.get(col).map(str::to_string),
            Err(e) => {
                warn!(error = %e, "skipping csv row");
                None
            }
        })
        .filter(|v| !v.is_empty())
        .collect()
}

// ── Sitemap ──

/// Fetch a sitemap and return its `<loc>` URLs, optionally filtered.
pub fn fetch_sitemap_urls(
    sitemap_url: &str,
    filter: Option<&Regex>,
) -> Result<Vec<String>, PipelineError> {
    info!("Fetching sitemap: {}", sitemap_url);
    let xml = reqwest::blocking::get(sitemap_url)
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| PipelineError::Seed(format!("failed to fetch sitemap {}: {}", sitemap_url, e)))?;

    let all_urls = parse_urlset(&xml)?;
    info!("Total URLs in sitemap: {}", all_urls.len());

    let filtered: Vec<String> = all_urls
        .into_iter()
        .filter(|url| filter.map_or(true, |re| re.is_match(url)))
        .collect();
    info!("Sitemap URLs after filtering: {}", filtered.len());
    Ok(filtered)
}

/// `<loc>` text of every `<url>` entry. Namespace prefixes are ignored and
/// CDATA sections are read as text.
fn parse_urlset(xml: &str) -> Result<Vec<String>, PipelineError> {
    let mut reader = Reader::from_str(xml);
    let mut open: Vec<Vec<u8>> = Vec::new();
    let mut loc: Option<String> = None;
    let mut urls = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| PipelineError::Seed(format!("invalid sitemap xml: {}", e)))?;
        match event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"loc" && open.last().is_some_and(|p| p == b"url") {
                    loc = Some(String::new());
                }
                open.push(name);
            }
            Event::Text(e) => {
                if let Some(buf) = loc.as_mut() {
                    let text = e
                        .unescape()
                        .map_err(|e| PipelineError::Seed(format!("bad sitemap text: {}", e)))?;
                    buf.push_str(&text);
                }
            }
            Event::CData(e) => {
                if let Some(buf) = loc.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"loc" {
                    if let Some(url) = loc.take() {
                        let url = url.trim();
                        if !url.is_empty() {
                            urls.push(url.to_string());
                        }
                    }
                }
                open.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(urls)
}

// ── Tests ──
