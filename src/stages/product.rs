use std::sync::LazyLock;
use std::time::Duration;

use itertools::Itertools;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};

use crate::error::TransformError;
use crate::item::{DataItem, ProductRecord};
use crate::node::Transform;
use crate::params::Params;

pub const STAGE: &str = "parse_amazon";
pub const CACHE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

static ASIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/dp/([A-Za-z0-9]{10})").unwrap());
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("#productTitle").unwrap());
static ALT_IMAGES: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#altImages img").unwrap());
static DESCRIPTION: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#productDescription").unwrap());
static BULLETS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div#productFactsDesktopExpander ul.a-unordered-list li").unwrap()
});

// Thumbnails for videos and 360 views are not product images.
const OVERLAY_MARKERS: &[&str] = &["play-button-overlay", "360_icon"];

/// Product Page in, ProductRecord out.
#[derive(Debug, Default)]
pub struct ProductTransform;

impl Transform for ProductTransform {
    fn apply(&mut self, item: DataItem, _params: &Params) -> Result<DataItem, TransformError> {
        let page = match item {
            DataItem::Page(p) => p,
            other @ (DataItem::Url(_)
            | DataItem::Document(_)
            | DataItem::Record(_)
            | DataItem::Response(_)) => {
                return Err(TransformError::Unsupported { kind: other.kind() })
            }
        };

        let record = extract_product(&page.address, &page.html);
        if record.title.is_empty() && record.asin.is_empty() {
            return Err(TransformError::Extraction(format!(
                "no product title or ASIN found at {}",
                page.address
            )));
        }
        debug!(
            images = record.image_urls.len(),
            bullets = record.bullets.len(),
            "product fields"
        );
        info!("Parsed product {} from {}", record.asin, record.address);
        Ok(DataItem::Record(record))
    }
}

pub fn extract_product(address: &str, html: &str) -> ProductRecord {
    let doc = Html::parse_document(html);
    ProductRecord {
        asin: asin_from_url(address),
        address: address.to_string(),
        title: doc.select(&TITLE).next().map(text_of).unwrap_or_default(),
        image_urls: doc
            .select(&ALT_IMAGES)
            .filter_map(|img| img.value().attr("src"))
            .filter(|src| !OVERLAY_MARKERS.iter().any(|m| src.contains(m)))
            .map(full_size_image)
            .unique()
            .collect(),
        description: doc.select(&DESCRIPTION).next().map(text_of).unwrap_or_default(),
        bullets: doc
            .select(&BULLETS)
            .map(text_of)
            .filter(|b| !b.is_empty())
            .collect(),
    }
}

/// The ten-character id after `/dp/`, else the second-to-last path segment.
pub fn asin_from_url(address: &str) -> String {
    if let Some(caps) = ASIN_RE.captures(address) {
        return caps[1].to_string();
    }
    let path = address.split(['?', '#']).next().unwrap_or(address);
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 2 {
        return String::new();
    }
    segments[segments.len() - 2].to_string()
}

/// Drop the size suffix: `.../I/81abc._AC_US40_.jpg` becomes `.../I/81abc.jpg`.
fn full_size_image(src: &str) -> String {
    let stem = src.split("._").next().unwrap_or(src);
    if stem.len() == src.len() {
        return src.to_string();
    }
    format!("{}.jpg", stem)
}

fn text_of(el: ElementRef) -> String {
    SPACES_RE
        .replace_all(&el.text().collect::<String>(), " ")
        .trim()
        .to_string()
}

// ── Tests ──
