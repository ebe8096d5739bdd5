//! One cacheable pipeline stage.
//!
//! An invocation loads its input (an upstream output directory or in-memory
//! seeds), resolves its cache directory from the parameters plus the input's
//! identity, and, when the cache is not usable, transforms each item in load
//! order and persists the survivors. A failed item is logged and dropped; the
//! remaining items keep their relative order and are re-indexed densely.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tracing::{info, info_span, warn};

use crate::cache::{CacheLocation, CacheStore};
use crate::error::{PipelineError, TransformError};
use crate::item::DataItem;
use crate::manifest;
use crate::params::{to_canonical_json, Params};

/// Stage-specific per-item work.
pub trait Transform {
    fn apply(&mut self, item: DataItem, params: &Params) -> Result<DataItem, TransformError>;
}

impl<F> Transform for F
where
    F: FnMut(DataItem, &Params) -> Result<DataItem, TransformError>,
{
    fn apply(&mut self, item: DataItem, params: &Params) -> Result<DataItem, TransformError> {
        self(item, params)
    }
}

/// What a Node reads from.
#[derive(Debug, Clone)]
pub enum NodeInput {
    /// Output directory of an upstream Node.
    Directory(PathBuf),
    /// Items supplied directly, e.g. seed URLs.
    Seeds(Vec<DataItem>),
}

impl NodeInput {
    /// Parameters that make the cache key distinguish different inputs. Only
    /// the input's path or its items' keys participate, never payloads.
    pub fn identity(&self) -> Params {
        match self {
            NodeInput::Directory(dir) => {
                Params::new().with("input_path", dir.to_string_lossy().into_owned())
            }
            NodeInput::Seeds(items) => {
                let keys = Value::Array(
                    items
                        .iter()
                        .map(|i| Value::String(format!("{}:{}", i.kind(), i.key())))
                        .collect(),
                );
                let digest = blake3::hash(to_canonical_json(&keys).as_bytes());
                Params::new()
                    .with("seed_digest", digest.to_hex().to_string())
                    .with("seed_count", items.len())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Cached,
    Populated { written: usize, dropped: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub output_dir: PathBuf,
    pub outcome: NodeOutcome,
}

/// Static description of a wired Node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub project: String,
    pub stage: String,
    pub base_path: PathBuf,
    pub cache_duration: Duration,
}

/// Object-safe view of a Node, so pipelines can hold heterogeneous stages.
pub trait StageRunner {
    fn run(&mut self, input: &NodeInput, params: &Params) -> Result<NodeReport, PipelineError>;
    fn summary(&self) -> NodeSummary;
}

pub struct Node<T> {
    cache: CacheStore,
    transform: T,
}

impl<T: Transform> Node<T> {
    pub fn new(location: CacheLocation, cache_duration: Duration, transform: T) -> Self {
        Self {
            cache: CacheStore::new(location, cache_duration),
            transform,
        }
    }

    pub fn stage(&self) -> &str {
        &self.cache.location().stage
    }

    pub fn run(&mut self, input: &NodeInput, params: &Params) -> Result<NodeReport, PipelineError> {
        let location = self.cache.location().clone();
        let _span = info_span!("node", project = %location.project, stage = %location.stage)
            .entered();

        let items = self.load(input)?;
        let key_params = params.clone().merged(&input.identity());
        let (dir, valid) = self.cache.resolve(&key_params)?;

        if valid && manifest::exists(&dir) {
            info!(dir = %dir.display(), "cache hit; skipping transform");
            return Ok(NodeReport {
                output_dir: dir,
                outcome: NodeOutcome::Cached,
            });
        }
        if valid {
            warn!(dir = %dir.display(), "fresh directory without manifest; repopulating");
        }

        let total = items.len();
        let outputs = self.populate(items, params);
        let written = manifest::write(&dir, &outputs)?;
        let dropped = total - written;
        info!(written, dropped, dir = %dir.display(), "stage complete");

        Ok(NodeReport {
            output_dir: dir,
            outcome: NodeOutcome::Populated { written, dropped },
        })
    }

    fn load(&self, input: &NodeInput) -> Result<Vec<DataItem>, PipelineError> {
        let items = match input {
            NodeInput::Directory(dir) => load_directory(dir)?,
            NodeInput::Seeds(items) => items.clone(),
        };
        if items.is_empty() {
            warn!("no input items");
            return Err(PipelineError::EmptyInput {
                stage: self.stage().to_string(),
            });
        }
        info!(count = items.len(), "loaded input");
        Ok(items)
    }

    fn populate(&mut self, items: Vec<DataItem>, params: &Params) -> Vec<DataItem> {
        let pb = progress_bar(items.len());
        let mut outputs = Vec::with_capacity(items.len());
        for item in items {
            let key = item.key().to_string();
            match self.transform.apply(item, params) {
                Ok(out) => outputs.push(out),
                Err(e) => warn!(key = %key, error = %e, "transform failed; item dropped"),
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        outputs
    }
}

impl<T: Transform> StageRunner for Node<T> {
    fn run(&mut self, input: &NodeInput, params: &Params) -> Result<NodeReport, PipelineError> {
        Node::run(self, input, params)
    }

    fn summary(&self) -> NodeSummary {
        let location = self.cache.location();
        NodeSummary {
            project: location.project.clone(),
            stage: location.stage.clone(),
            base_path: location.base_path(),
            cache_duration: self.cache.cache_duration(),
        }
    }
}

fn load_directory(dir: &Path) -> Result<Vec<DataItem>, PipelineError> {
    info!(dir = %dir.display(), "loading upstream manifest");
    manifest::read(dir)
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Document, Page};
    use std::cell::Cell;
    use std::fs;
    use std::rc::Rc;
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn to_page(item: DataItem, _p: &Params) -> Result<DataItem, TransformError> {
        match item {
            DataItem::Url(u) => Ok(DataItem::Page(Page {
                html: format!("<html>{}</html>", u.address),
                address: u.address,
            })),
            other => Err(TransformError::Unsupported { kind: other.kind() }),
        }
    }

    fn counting(
        calls: Rc<Cell<usize>>,
    ) -> impl FnMut(DataItem, &Params) -> Result<DataItem, TransformError> {
        move |item, params| {
            calls.set(calls.get() + 1);
            to_page(item, params)
        }
    }

    fn seeds(urls: &[&str]) -> NodeInput {
        NodeInput::Seeds(urls.iter().map(|u| DataItem::url(*u)).collect())
    }

    /// Push every file in `dir` back by `by`.
    fn age(dir: &Path, by: Duration) {
        let then = std::time::SystemTime::now() - by;
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_file() {
                let f = fs::File::options().write(true).open(&path).unwrap();
                f.set_modified(then).unwrap();
            }
        }
    }

    #[test]
    fn second_run_is_cached_and_byte_identical() {
        let tmp = tempdir().unwrap();
        let calls = Rc::new(Cell::new(0));
        let mut node = Node::new(
            CacheLocation::new(tmp.path(), "proj", "get_html"),
            HOUR,
            counting(calls.clone()),
        );
        let input = seeds(&["http://example.com/a", "http://example.com/b"]);
        let params = Params::new().with("execute_js", false);

        let first = node.run(&input, &params).unwrap();
        assert_eq!(first.outcome, NodeOutcome::Populated { written: 2, dropped: 0 });
        assert_eq!(calls.get(), 2);
        let bytes = fs::read(first.output_dir.join("all.json")).unwrap();

        let second = node.run(&input, &params).unwrap();
        assert_eq!(second.outcome, NodeOutcome::Cached);
        assert_eq!(second.output_dir, first.output_dir);
        assert_eq!(calls.get(), 2);
        assert_eq!(fs::read(second.output_dir.join("all.json")).unwrap(), bytes);
    }

    #[test]
    fn different_params_or_seeds_use_different_dirs() {
        let tmp = tempdir().unwrap();
        let mut node = Node::new(
            CacheLocation::new(tmp.path(), "proj", "get_html"),
            HOUR,
            to_page,
        );
        let a = node
            .run(&seeds(&["http://a"]), &Params::new().with("execute_js", false))
            .unwrap();
        let b = node
            .run(&seeds(&["http://a"]), &Params::new().with("execute_js", true))
            .unwrap();
        let c = node
            .run(&seeds(&["http://b"]), &Params::new().with("execute_js", false))
            .unwrap();
        assert_ne!(a.output_dir, b.output_dir);
        assert_ne!(a.output_dir, c.output_dir);
    }

    #[test]
    fn failing_item_is_dropped_and_others_survive() {
        let tmp = tempdir().unwrap();
        let mut node = Node::new(
            CacheLocation::new(tmp.path(), "proj", "get_html"),
            HOUR,
            |item: DataItem, p: &Params| {
                if item.key().ends_with("/2") {
                    return Err(TransformError::Browser("boom".into()));
                }
                to_page(item, p)
            },
        );
        let report = node
            .run(&seeds(&["http://x/1", "http://x/2", "http://x/3"]), &Params::new())
            .unwrap();
        assert_eq!(report.outcome, NodeOutcome::Populated { written: 2, dropped: 1 });

        let items = manifest::read(&report.output_dir).unwrap();
        let keys: Vec<&str> = items.iter().map(|i| i.key()).collect();
        assert_eq!(keys, vec!["http://x/1", "http://x/3"]);

        let entries = manifest::read_entries(&report.output_dir).unwrap();
        assert_eq!(entries[1]["file_name"], "payload_1.html");
        let payload = fs::read_to_string(report.output_dir.join("payload_1.html")).unwrap();
        assert_eq!(payload, "<html>http://x/3</html>");
    }

    #[test]
    fn empty_seeds_fail_without_output_dir() {
        let tmp = tempdir().unwrap();
        let mut node = Node::new(
            CacheLocation::new(tmp.path(), "proj", "get_html"),
            HOUR,
            to_page,
        );
        let err = node.run(&NodeInput::Seeds(vec![]), &Params::new()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput { ref stage } if stage == "get_html"));
        assert!(!tmp.path().join("proj").exists());
    }

    #[test]
    fn empty_upstream_manifest_fails() {
        let tmp = tempdir().unwrap();
        let upstream = tmp.path().join("upstream");
        fs::create_dir_all(&upstream).unwrap();
        manifest::write(&upstream, &[]).unwrap();
        let mut node = Node::new(
            CacheLocation::new(tmp.path(), "proj", "get_markdown"),
            HOUR,
            to_page,
        );
        let err = node
            .run(&NodeInput::Directory(upstream), &Params::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput { .. }));
    }

    #[test]
    fn reads_typed_items_from_upstream_directory() {
        let tmp = tempdir().unwrap();
        let upstream = tmp.path().join("upstream");
        fs::create_dir_all(&upstream).unwrap();
        manifest::write(
            &upstream,
            &[DataItem::Page(Page {
                address: "http://a".into(),
                html: "<h1>A</h1>".into(),
            })],
        )
        .unwrap();

        let mut node = Node::new(
            CacheLocation::new(tmp.path(), "proj", "get_markdown"),
            HOUR,
            |item: DataItem, _p: &Params| match item {
                DataItem::Page(p) => Ok(DataItem::Document(Document {
                    address: p.address,
                    body: "# A".into(),
                })),
                other => Err(TransformError::Unsupported { kind: other.kind() }),
            },
        );
        let report = node
            .run(&NodeInput::Directory(upstream), &Params::new())
            .unwrap();
        let out = manifest::read(&report.output_dir).unwrap();
        assert_eq!(
            out,
            vec![DataItem::Document(Document {
                address: "http://a".into(),
                body: "# A".into()
            })]
        );
    }

    #[test]
    fn fresh_dir_without_manifest_is_repopulated() {
        let tmp = tempdir().unwrap();
        let calls = Rc::new(Cell::new(0));
        let mut node = Node::new(
            CacheLocation::new(tmp.path(), "proj", "get_html"),
            HOUR,
            counting(calls.clone()),
        );
        let input = seeds(&["http://a"]);
        let first = node.run(&input, &Params::new()).unwrap();
        fs::remove_file(first.output_dir.join("all.json")).unwrap();

        let second = node.run(&input, &Params::new()).unwrap();
        assert!(matches!(second.outcome, NodeOutcome::Populated { written: 1, .. }));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn expired_dir_runs_the_transform_again() {
        let tmp = tempdir().unwrap();
        let calls = Rc::new(Cell::new(0));
        let mut node = Node::new(
            CacheLocation::new(tmp.path(), "proj", "get_html"),
            HOUR,
            counting(calls.clone()),
        );
        let input = seeds(&["http://a"]);
        let first = node.run(&input, &Params::new()).unwrap();
        assert_eq!(calls.get(), 1);

        age(&first.output_dir, 2 * HOUR);
        let second = node.run(&input, &Params::new()).unwrap();
        assert_eq!(second.output_dir, first.output_dir);
        assert_eq!(second.outcome, NodeOutcome::Populated { written: 1, dropped: 0 });
        assert_eq!(calls.get(), 2);

        let third = node.run(&input, &Params::new()).unwrap();
        assert_eq!(third.outcome, NodeOutcome::Cached);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn interrupted_rewrite_is_not_served_from_cache() {
        let tmp = tempdir().unwrap();
        let generation = Rc::new(Cell::new(0));
        let generation_in = generation.clone();
        let mut node = Node::new(
            CacheLocation::new(tmp.path(), "proj", "get_html"),
            HOUR,
            move |item: DataItem, _p: &Params| -> Result<DataItem, TransformError> {
                Ok(DataItem::Page(Page {
                    address: item.key().to_string(),
                    html: format!("gen{}", generation_in.get()),
                }))
            },
        );
        let input = seeds(&["http://x/1", "http://x/2"]);
        let first = node.run(&input, &Params::new()).unwrap();
        let dir = first.output_dir;

        // Expire the output, then make payload_1 unwritable.
        age(&dir, 2 * HOUR);
        fs::remove_file(dir.join("payload_1.html")).unwrap();
        fs::create_dir(dir.join("payload_1.html")).unwrap();
        generation.set(1);
        assert!(node.run(&input, &Params::new()).is_err());
        assert!(!manifest::exists(&dir));

        fs::remove_dir(dir.join("payload_1.html")).unwrap();
        generation.set(2);
        let third = node.run(&input, &Params::new()).unwrap();
        assert!(matches!(third.outcome, NodeOutcome::Populated { written: 2, .. }));
        let items = manifest::read(&dir).unwrap();
        let payload = fs::read_to_string(dir.join("payload_0.html")).unwrap();
        assert_eq!(payload, "gen2");
        assert_eq!(items[0].payload(), payload);
    }

    #[test]
    fn summary_reports_wiring() {
        let node = Node::new(
            CacheLocation::new("data", "proj", "get_html"),
            HOUR,
            to_page,
        );
        let s = node.summary();
        assert_eq!(s.project, "proj");
        assert_eq!(s.base_path, PathBuf::from("data").join("proj").join("get_html"));
    }
}
