use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use tracing::{debug, info};

use crate::error::TransformError;
use crate::item::{DataItem, Page};
use crate::node::Transform;
use crate::params::Params;

pub const STAGE: &str = "get_html";
pub const CACHE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
pub const EXECUTE_JS: &str = "execute_js";

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Retrieves the HTML for an address.
pub trait Fetcher {
    fn fetch(&mut self, address: &str, execute_js: bool) -> Result<String, TransformError>;
}

/// Plain HTTP for static pages, a headless browser when JavaScript must run.
#[derive(Debug, Default)]
pub struct WebFetcher {
    client: Option<Client>,
    chrome: Option<PathBuf>,
    user_data_dir: Option<PathBuf>,
}

impl WebFetcher {
    pub fn new(chrome: Option<PathBuf>, user_data_dir: Option<PathBuf>) -> Self {
        Self {
            client: None,
            chrome,
            user_data_dir,
        }
    }

    // Built on first use; `Client` is a cheap handle to a shared pool.
    fn client(&mut self) -> Result<Client, TransformError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        self.client = Some(client.clone());
        Ok(client)
    }

    fn fetch_http(&mut self, address: &str) -> Result<String, TransformError> {
        let response = self.client()?.get(address).send()?.error_for_status()?;
        Ok(response.text()?)
    }

    fn fetch_browser(&self, address: &str) -> Result<String, TransformError> {
        let chrome = self.chrome.as_ref().ok_or_else(|| {
            TransformError::Browser("CHROME_EXECUTABLE_PATH is not set".into())
        })?;
        let mut cmd = Command::new(chrome);
        cmd.args(["--headless=new", "--disable-gpu", "--no-first-run", "--dump-dom"]);
        if let Some(dir) = &self.user_data_dir {
            cmd.arg(format!("--user-data-dir={}", dir.display()));
        }
        cmd.arg(address);

        let output = cmd.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransformError::Browser(format!(
                "{} exited with {}: {}",
                chrome.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Fetcher for WebFetcher {
    fn fetch(&mut self, address: &str, execute_js: bool) -> Result<String, TransformError> {
        if execute_js {
            self.fetch_browser(address)
        } else {
            self.fetch_http(address)
        }
    }
}

/// Url or Page in, Page with fresh HTML out.
pub struct FetchTransform<F> {
    fetcher: F,
}

impl<F: Fetcher> FetchTransform<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }
}

impl<F: Fetcher> Transform for FetchTransform<F> {
    fn apply(&mut self, item: DataItem, params: &Params) -> Result<DataItem, TransformError> {
        let execute_js = params.get_bool(EXECUTE_JS).unwrap_or(false);
        let address = match item {
            DataItem::Url(u) => u.address,
            DataItem::Page(p) => p.address,
            other @ (DataItem::Document(_) | DataItem::Record(_) | DataItem::Response(_)) => {
                return Err(TransformError::Unsupported { kind: other.kind() })
            }
        };

        let start = Instant::now();
        let html = self.fetcher.fetch(&address, execute_js)?;
        debug!(bytes = html.len(), latency_ms = start.elapsed().as_millis() as u64, "fetched");
        info!("Fetched HTML from {}", address);
        Ok(DataItem::Page(Page { address, html }))
    }
}

// ── Tests ──
