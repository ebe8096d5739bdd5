use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ManifestEntryError;

pub const DATA_TYPE_FIELD: &str = "data_type";
pub const FILE_NAME_FIELD: &str = "file_name";

// ── Variants ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Url {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Page {
    pub address: String,
    pub html: String,
}

/// Markdown converted from a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    pub address: String,
    pub body: String,
}

/// Structured fields scraped from a product page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProductRecord {
    pub asin: String,
    pub address: String,
    pub title: String,
    pub image_urls: Vec<String>,
    pub description: String,
    pub bullets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelResponse {
    /// Natural key of the item the prompt was built from.
    pub source: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub response: String,
}

/// Closed set of payloads that flow between Nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum DataItem {
    Url(Url),
    Page(Page),
    Document(Document),
    Record(ProductRecord),
    Response(ModelResponse),
}

impl DataItem {
    pub fn url(address: impl Into<String>) -> Self {
        DataItem::Url(Url {
            address: address.into(),
        })
    }

    /// Tag written to the manifest's `data_type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            DataItem::Url(_) => "Url",
            DataItem::Page(_) => "Page",
            DataItem::Document(_) => "Document",
            DataItem::Record(_) => "ProductRecord",
            DataItem::Response(_) => "ModelResponse",
        }
    }

    /// Identifying key used in logs.
    pub fn key(&self) -> &str {
        match self {
            DataItem::Url(u) => &u.address,
            DataItem::Page(p) => &p.address,
            DataItem::Document(d) => &d.address,
            DataItem::Record(r) if !r.asin.is_empty() => &r.asin,
            DataItem::Record(r) => &r.address,
            DataItem::Response(m) => &m.source,
        }
    }

    pub fn payload_extension(&self) -> &'static str {
        match self {
            DataItem::Url(_) | DataItem::Response(_) => "txt",
            DataItem::Page(_) => "html",
            DataItem::Document(_) => "md",
            DataItem::Record(_) => "json",
        }
    }

    /// Content of the per-item payload file.
    pub fn payload(&self) -> String {
        match self {
            DataItem::Url(u) => u.address.clone(),
            DataItem::Page(p) => p.html.clone(),
            DataItem::Document(d) => d.body.clone(),
            DataItem::Record(r) => serde_json::to_string_pretty(r).unwrap_or_default(),
            DataItem::Response(m) => m.response.clone(),
        }
    }

    pub fn write_payload(&self, path: &Path) -> std::io::Result<()> {
        fs::write(path, self.payload())
    }

    /// Manifest entry: the variant's fields plus `data_type` and `file_name`.
    pub fn to_manifest_entry(&self, file_name: &str) -> Value {
        let fields = match self {
            DataItem::Url(v) => serde_json::to_value(v),
            DataItem::Page(v) => serde_json::to_value(v),
            DataItem::Document(v) => serde_json::to_value(v),
            DataItem::Record(v) => serde_json::to_value(v),
            DataItem::Response(v) => serde_json::to_value(v),
        };
        // Plain structs of strings always serialize to an object.
        let mut map = match fields {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert(DATA_TYPE_FIELD.into(), Value::String(self.kind().into()));
        map.insert(FILE_NAME_FIELD.into(), Value::String(file_name.into()));
        Value::Object(map)
    }

    /// Decode one manifest entry. Unknown `data_type` values and unexpected or
    /// missing fields are rejected rather than skipped.
    pub fn from_manifest_entry(index: usize, entry: &Value) -> Result<Self, ManifestEntryError> {
        let Value::Object(map) = entry else {
            return Err(ManifestEntryError::NotAnObject { index });
        };
        let mut fields = map.clone();
        let data_type = match fields.remove(DATA_TYPE_FIELD) {
            Some(Value::String(s)) => s,
            _ => return Err(ManifestEntryError::MissingDataType { index }),
        };
        fields.remove(FILE_NAME_FIELD);
        let fields = Value::Object(fields);

        match data_type.as_str() {
            "Url" => decode(index, "Url", fields).map(DataItem::Url),
            "Page" => decode(index, "Page", fields).map(DataItem::Page),
            "Document" => decode(index, "Document", fields).map(DataItem::Document),
            "ProductRecord" => decode(index, "ProductRecord", fields).map(DataItem::Record),
            "ModelResponse" => decode(index, "ModelResponse", fields).map(DataItem::Response),
            _ => Err(ManifestEntryError::UnknownDataType { index, data_type }),
        }
    }
}

fn decode<T: DeserializeOwned>(
    index: usize,
    data_type: &'static str,
    fields: Value,
) -> Result<T, ManifestEntryError> {
    serde_json::from_value(fields).map_err(|source| ManifestEntryError::Shape {
        index,
        data_type,
        source,
    })
}

// ── Tests ──
