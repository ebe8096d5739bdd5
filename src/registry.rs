//! Workflow table, built once at startup and passed to whatever turns CLI
//! input into a [`Pipeline`].

use clap::{value_parser, Arg, ArgAction};

use crate::cache::CacheLocation;
use crate::node::Node;
use crate::params::Params;
use crate::pipeline::{Pipeline, Step};
use crate::settings::Settings;
use crate::stages::fetch::{self, FetchTransform, WebFetcher, EXECUTE_JS};
use crate::stages::llm::{
    self, ChatTransform, OpenAiClient, FREQUENCY_PENALTY, MAX_TOKENS, MODEL, PRESENCE_PENALTY,
    SYSTEM_PROMPT, TEMPERATURE, TOP_P, USER_PROMPT,
};
use crate::stages::markdown::{self, MarkdownTransform, STRIP_IMAGES};
use crate::stages::product::{self, ProductTransform};

pub const URL: &str = "url";
pub const INPUT_DATA_DIR: &str = "input_data_dir";
pub const SITEMAP: &str = "sitemap";
pub const SITEMAP_FILTER: &str = "sitemap_filter";

const WEB_SEEDS: &[&str] = &[URL, INPUT_DATA_DIR, SITEMAP, SITEMAP_FILTER];

const BLOG_SYSTEM_PROMPT: &str =
    "You are a blog writer who needs to write a blog post about the product.";
const BLOG_USER_PROMPT: &str = "Write a blog post about the product.";
const SUMMARIZE_USER_PROMPT: &str = "Summarize the product description";

type Build = fn(&Settings, &str) -> Pipeline;

struct Workflow {
    name: &'static str,
    about: &'static str,
    seeds: &'static [&'static str],
    flags: &'static [&'static str],
    build: Build,
}

fn workflows() -> Vec<Workflow> {
    vec![
        Workflow {
            name: "get_html",
            about: "Fetch the HTML of each seed URL",
            seeds: WEB_SEEDS,
            flags: &[EXECUTE_JS],
            build: get_html,
        },
        Workflow {
            name: "page_to_markdown",
            about: "Fetch pages and convert them to Markdown",
            seeds: WEB_SEEDS,
            flags: &[EXECUTE_JS, STRIP_IMAGES],
            build: page_to_markdown,
        },
        Workflow {
            name: "parse_product",
            about: "Fetch product pages and extract their fields",
            seeds: WEB_SEEDS,
            flags: &[EXECUTE_JS],
            build: parse_product,
        },
        Workflow {
            name: "summarize",
            about: "Summarize every item of an existing stage output",
            seeds: &[INPUT_DATA_DIR],
            flags: &[SYSTEM_PROMPT, USER_PROMPT],
            build: summarize,
        },
        Workflow {
            name: "product_blog",
            about: "Fetch product pages, convert to Markdown, write a blog post for each",
            seeds: WEB_SEEDS,
            flags: &[EXECUTE_JS, STRIP_IMAGES, SYSTEM_PROMPT, USER_PROMPT],
            build: product_blog,
        },
    ]
}

pub struct Registry {
    settings: Settings,
    workflows: Vec<Workflow>,
}

impl Registry {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            workflows: workflows(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.workflows.iter().map(|w| w.name).collect()
    }

    /// `None` for an unknown workflow; there is no fallback.
    pub fn create(&self, workflow: &str, project: &str) -> Option<Pipeline> {
        self.lookup(workflow).map(|w| (w.build)(&self.settings, project))
    }

    pub fn about(&self, workflow: &str) -> Option<&'static str> {
        self.lookup(workflow).map(|w| w.about)
    }

    /// Stage flags forwarded into step parameters.
    pub fn stage_flags(&self, workflow: &str) -> Option<&'static [&'static str]> {
        self.lookup(workflow).map(|w| w.flags)
    }

    /// Command-line arguments the workflow contributes.
    pub fn arguments(&self, workflow: &str) -> Option<Vec<Arg>> {
        self.lookup(workflow).map(|w| w.seeds.iter().chain(w.flags).copied().map(flag_arg).collect())
    }

    fn lookup(&self, workflow: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.name == workflow)
    }
}

/// Flags that take no value.
pub fn is_switch(flag: &str) -> bool {
    matches!(flag, EXECUTE_JS | STRIP_IMAGES)
}

fn flag_arg(flag: &'static str) -> Arg {
    let arg = Arg::new(flag).long(flag);
    match flag {
        URL => arg
            .action(ArgAction::Append)
            .value_name("URL")
            .help("Seed URL; may be repeated"),
        INPUT_DATA_DIR => arg
            .value_parser(value_parser!(std::path::PathBuf))
            .value_name("DIR")
            .help("Directory of URL lists (*.csv, *.txt) or a previous stage's output"),
        SITEMAP => arg.value_name("URL").help("Sitemap to read seed URLs from"),
        SITEMAP_FILTER => arg
            .value_name("REGEX")
            .requires(SITEMAP)
            .help("Keep only sitemap URLs matching this pattern"),
        EXECUTE_JS => arg
            .action(ArgAction::SetTrue)
            .help("Render pages in a headless browser"),
        STRIP_IMAGES => arg
            .action(ArgAction::SetTrue)
            .help("Remove images from the Markdown"),
        SYSTEM_PROMPT => arg.value_name("TEXT").help("System prompt for the model"),
        USER_PROMPT => arg.value_name("TEXT").help("User prompt for the model"),
        _ => arg,
    }
}

// ── Workflows ──

fn location(settings: &Settings, project: &str, stage: &str) -> CacheLocation {
    CacheLocation::new(&settings.project_data_root_path, project, stage)
}

fn fetch_step(settings: &Settings, project: &str) -> Step {
    let fetcher = WebFetcher::new(
        settings.chrome_executable_path.clone(),
        settings.user_data_root_path.clone(),
    );
    Step::new(
        Node::new(
            location(settings, project, fetch::STAGE),
            fetch::CACHE_DURATION,
            FetchTransform::new(fetcher),
        ),
        Params::new().with(EXECUTE_JS, false),
        &[EXECUTE_JS],
    )
}

fn markdown_step(settings: &Settings, project: &str) -> Step {
    Step::new(
        Node::new(
            location(settings, project, markdown::STAGE),
            markdown::CACHE_DURATION,
            MarkdownTransform,
        ),
        Params::new().with(STRIP_IMAGES, false),
        &[STRIP_IMAGES],
    )
}

fn chat_step(settings: &Settings, project: &str, stage: &str, params: Params) -> Step {
    let client = OpenAiClient::new(
        settings.openai_api_key.clone(),
        settings.openai_base_url.clone(),
    );
    Step::new(
        Node::new(
            location(settings, project, stage),
            llm::CACHE_DURATION,
            ChatTransform::new(client),
        ),
        params,
        &[SYSTEM_PROMPT, USER_PROMPT],
    )
}

fn get_html(settings: &Settings, project: &str) -> Pipeline {
    Pipeline::new("get_html").then(fetch_step(settings, project))
}

fn page_to_markdown(settings: &Settings, project: &str) -> Pipeline {
    Pipeline::new("page_to_markdown")
        .then(fetch_step(settings, project))
        .then(markdown_step(settings, project))
}

fn parse_product(settings: &Settings, project: &str) -> Pipeline {
    Pipeline::new("parse_product")
        .then(fetch_step(settings, project))
        .then(Step::new(
            Node::new(
                location(settings, project, product::STAGE),
                product::CACHE_DURATION,
                ProductTransform,
            ),
            Params::new(),
            &[],
        ))
}

fn summarize(settings: &Settings, project: &str) -> Pipeline {
    let params = Params::new()
        .with(SYSTEM_PROMPT, "")
        .with(USER_PROMPT, SUMMARIZE_USER_PROMPT);
    Pipeline::new("summarize").then(chat_step(settings, project, llm::SUMMARIZE_STAGE, params))
}

fn product_blog(settings: &Settings, project: &str) -> Pipeline {
    let params = Params::new()
        .with(SYSTEM_PROMPT, BLOG_SYSTEM_PROMPT)
        .with(USER_PROMPT, BLOG_USER_PROMPT)
        .with(MODEL, "gpt-3.5-turbo")
        .with(TEMPERATURE, 0.5)
        .with(MAX_TOKENS, 2000)
        .with(TOP_P, 1.0)
        .with(FREQUENCY_PENALTY, 0.0)
        .with(PRESENCE_PENALTY, 0.0);
    Pipeline::new("product_blog")
        .then(fetch_step(settings, project))
        .then(markdown_step(settings, project))
        .then(chat_step(settings, project, llm::BLOG_STAGE, params))
}

// ── Tests ──
