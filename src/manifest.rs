use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::error::{ManifestEntryError, PipelineError};
use crate::item::DataItem;

pub const MANIFEST_FILE: &str = "all.json";

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

pub fn exists(dir: &Path) -> bool {
    manifest_path(dir).is_file()
}

pub fn payload_file_name(index: usize, item: &DataItem) -> String {
    format!("payload_{}.{}", index, item.payload_extension())
}

/// Write one payload file per item, then `all.json`. Entry `i` always
/// references `payload_{i}.*`. Returns the number of entries written.
///
/// Any previous `all.json` is removed before the first payload is touched and
/// the new one is renamed into place last, so a write that fails partway
/// leaves a directory without a manifest.
pub fn write(dir: &Path, items: &[DataItem]) -> Result<usize, PipelineError> {
    let path = manifest_path(dir);
    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(PipelineError::io(&path, e)),
    }

    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let file_name = payload_file_name(index, item);
        let path = dir.join(&file_name);
        item.write_payload(&path)
            .map_err(|e| PipelineError::io(&path, e))?;
        entries.push(item.to_manifest_entry(&file_name));
    }

    let staged = dir.join(format!("{}.tmp", MANIFEST_FILE));
    let file = File::create(&staged).map_err(|e| PipelineError::io(&staged, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &Value::Array(entries))
        .map_err(|e| PipelineError::io(&staged, e.into()))?;
    writer.flush().map_err(|e| PipelineError::io(&staged, e))?;
    drop(writer);
    fs::rename(&staged, &path).map_err(|e| PipelineError::io(&path, e))?;

    info!(dir = %dir.display(), count = items.len(), "wrote manifest");
    Ok(items.len())
}

/// Load every item listed in `dir/all.json`, in manifest order.
pub fn read(dir: &Path) -> Result<Vec<DataItem>, PipelineError> {
    let entries = read_entries(dir)?;
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| DataItem::from_manifest_entry(i, entry))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| PipelineError::Manifest {
            path: manifest_path(dir),
            source,
        })
}

/// Raw manifest entries, `file_name` included.
pub fn read_entries(dir: &Path) -> Result<Vec<Value>, PipelineError> {
    let path = manifest_path(dir);
    let file = File::open(&path).map_err(|e| PipelineError::io(&path, e))?;
    match serde_json::from_reader(BufReader::new(file)) {
        Ok(Value::Array(entries)) => Ok(entries),
        Ok(_) => Err(PipelineError::Manifest {
            path,
            source: ManifestEntryError::NotAnArray,
        }),
        Err(e) => Err(PipelineError::Manifest {
            path,
            source: ManifestEntryError::Json(e),
        }),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Document, Page};
    use tempfile::tempdir;

    #[test]
    fn payload_files_align_with_entries() {
        let tmp = tempdir().unwrap();
        let items = vec![
            DataItem::Page(Page {
                address: "http://example.com/a".into(),
                html: "<p>a</p>".into(),
            }),
            DataItem::Document(Document {
                address: "http://example.com/b".into(),
                body: "b".into(),
            }),
        ];
        assert_eq!(write(tmp.path(), &items).unwrap(), 2);

        let entries = read_entries(tmp.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["file_name"], "payload_0.html");
        assert_eq!(entries[1]["file_name"], "payload_1.md");
        for (entry, item) in entries.iter().zip(&items) {
            let name = entry["file_name"].as_str().unwrap();
            let content = fs::read_to_string(tmp.path().join(name)).unwrap();
            assert_eq!(content, item.payload());
        }

        assert_eq!(read(tmp.path()).unwrap(), items);
    }

    #[test]
    fn failed_rewrite_leaves_no_manifest() {
        let tmp = tempdir().unwrap();
        let page = |html: &str| {
            DataItem::Page(Page {
                address: "http://example.com/a".into(),
                html: html.into(),
            })
        };
        write(tmp.path(), &[page("old"), page("old")]).unwrap();
        assert!(exists(tmp.path()));

        fs::remove_file(tmp.path().join("payload_1.html")).unwrap();
        fs::create_dir(tmp.path().join("payload_1.html")).unwrap();
        assert!(write(tmp.path(), &[page("new"), page("new")]).is_err());
        assert!(!exists(tmp.path()));

        fs::remove_dir(tmp.path().join("payload_1.html")).unwrap();
        write(tmp.path(), &[page("new"), page("new")]).unwrap();
        assert_eq!(read(tmp.path()).unwrap(), vec![page("new"), page("new")]);
        assert!(!tmp.path().join("all.json.tmp").exists());
    }

    #[test]
    fn missing_manifest_is_io_error() {
        let tmp = tempdir().unwrap();
        assert!(matches!(read(tmp.path()), Err(PipelineError::Io { .. })));
        assert!(!exists(tmp.path()));
    }

    #[test]
    fn non_array_manifest_rejected() {
        let tmp = tempdir().unwrap();
        fs::write(manifest_path(tmp.path()), "{}").unwrap();
        assert!(matches!(
            read(tmp.path()),
            Err(PipelineError::Manifest {
                source: ManifestEntryError::NotAnArray,
                ..
            })
        ));
    }
}
