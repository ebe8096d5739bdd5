use std::sync::LazyLock;
use std::time::Duration;

use itertools::Itertools;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::info;

use crate::error::TransformError;
use crate::item::{DataItem, Document};
use crate::node::Transform;
use crate::params::Params;

pub const STAGE: &str = "get_markdown";
pub const CACHE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
pub const STRIP_IMAGES: &str = "strip_images";

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\r\n]+").unwrap());
static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

const SKIPPED: &[&str] = &[
    "script", "style", "noscript", "head", "template", "svg", "iframe", "form", "button",
];

/// Page in, Markdown Document out.
#[derive(Debug, Default)]
pub struct MarkdownTransform;

impl Transform for MarkdownTransform {
    fn apply(&mut self, item: DataItem, params: &Params) -> Result<DataItem, TransformError> {
        let page = match item {
            DataItem::Page(p) => p,
            other @ (DataItem::Url(_)
            | DataItem::Document(_)
            | DataItem::Record(_)
            | DataItem::Response(_)) => {
                return Err(TransformError::Unsupported { kind: other.kind() })
            }
        };
        if page.html.trim().is_empty() {
            return Err(TransformError::Extraction("page has no HTML".into()));
        }

        let mut body = html_to_markdown(&page.html);
        if params.get_bool(STRIP_IMAGES).unwrap_or(false) {
            body = strip_images(&body);
        }
        info!("Converted HTML to Markdown for {}", page.address);
        Ok(DataItem::Document(Document {
            address: page.address,
            body,
        }))
    }
}

/// Convert the document's `<body>` (or the whole document) to Markdown.
pub fn html_to_markdown(html: &str) -> String {
    let doc = Html::parse_document(html);
    let root = doc
        .select(&BODY)
        .next()
        .unwrap_or_else(|| doc.root_element());

    let mut out = String::new();
    render_children(root, &mut out, &Ctx::default());
    tidy(&out)
}

/// Remove markdown image syntax: ![alt](url)
pub fn strip_images(md: &str) -> String {
    let cleaned = IMAGE_RE.replace_all(md, "");
    tidy(&cleaned)
}

fn tidy(md: &str) -> String {
    let trimmed = md.lines().map(str::trim_end).join("\n");
    BLANKS_RE.replace_all(&trimmed, "\n\n").trim().to_string()
}

// ── Rendering ──

#[derive(Clone, Default)]
struct Ctx {
    pre: bool,
    list_depth: usize,
}

fn render_children(el: ElementRef, out: &mut String, ctx: &Ctx) {
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            render_element(child_el, out, ctx);
        } else if let Some(text) = child.value().as_text() {
            if ctx.pre {
                out.push_str(text);
            } else {
                push_inline_text(out, text);
            }
        }
    }
}

fn push_inline_text(out: &mut String, text: &str) {
    let collapsed = SPACES_RE.replace_all(text, " ");
    if collapsed == " " {
        if !out.is_empty() && !out.ends_with([' ', '\n']) {
            out.push(' ');
        }
        return;
    }
    let collapsed = if out.is_empty() || out.ends_with([' ', '\n']) {
        collapsed.trim_start()
    } else {
        &collapsed[..]
    };
    out.push_str(collapsed);
}

fn inline(el: ElementRef, ctx: &Ctx) -> String {
    let mut s = String::new();
    render_children(el, &mut s, ctx);
    s.trim().to_string()
}

fn block_break(out: &mut String) {
    let trimmed = out.trim_end_matches([' ', '\t']).len();
    out.truncate(trimmed);
    if out.is_empty() {
        return;
    }
    if !out.ends_with("\n\n") {
        out.push_str(if out.ends_with('\n') { "\n" } else { "\n\n" });
    }
}

fn render_element(el: ElementRef, out: &mut String, ctx: &Ctx) {
    let name = el.value().name();
    if SKIPPED.contains(&name) {
        return;
    }
    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name[1..].parse::<usize>().unwrap_or(1);
            let text = inline(el, ctx);
            if !text.is_empty() {
                block_break(out);
                out.push_str(&"#".repeat(level));
                out.push(' ');
                out.push_str(&text);
                block_break(out);
            }
        }
        "p" | "div" | "section" | "article" | "main" | "header" | "footer" | "nav" | "aside" => {
            block_break(out);
            render_children(el, out, ctx);
            block_break(out);
        }
        "br" => out.push('\n'),
        "hr" => {
            block_break(out);
            out.push_str("---");
            block_break(out);
        }
        "a" => {
            let text = inline(el, ctx);
            match el.value().attr("href") {
                Some(href) if !href.starts_with("javascript:") && !text.is_empty() => {
                    push_inline_text(out, &format!("[{}]({})", text, href.trim()));
                }
                _ => push_inline_text(out, &text),
            }
        }
        "img" => {
            if let Some(src) = el.value().attr("src") {
                let alt = el.value().attr("alt").unwrap_or("");
                push_inline_text(out, &format!("![{}]({})", alt.trim(), src.trim()));
            }
        }
        "strong" | "b" => wrap_inline(el, out, ctx, "**"),
        "em" | "i" => wrap_inline(el, out, ctx, "*"),
        "code" if !ctx.pre => wrap_inline(el, out, ctx, "`"),
        "pre" => {
            block_break(out);
            let pre_ctx = Ctx {
                pre: true,
                ..ctx.clone()
            };
            let mut code = String::new();
            render_children(el, &mut code, &pre_ctx);
            out.push_str("```\n");
            out.push_str(code.trim_matches('\n'));
            out.push_str("\n```");
            block_break(out);
        }
        "blockquote" => {
            block_break(out);
            let mut inner = String::new();
            render_children(el, &mut inner, ctx);
            let quoted = tidy(&inner).lines().map(|l| format!("> {}", l)).join("\n");
            out.push_str(&quoted);
            block_break(out);
        }
        "ul" | "ol" => render_list(el, out, ctx, name == "ol"),
        "table" => render_table(el, out, ctx),
        _ => render_children(el, out, ctx),
    }
}

fn wrap_inline(el: ElementRef, out: &mut String, ctx: &Ctx, marker: &str) {
    let text = inline(el, ctx);
    if !text.is_empty() {
        push_inline_text(out, &format!("{}{}{}", marker, text, marker));
    }
}

fn render_list(el: ElementRef, out: &mut String, ctx: &Ctx, ordered: bool) {
    let nested = Ctx {
        list_depth: ctx.list_depth + 1,
        ..ctx.clone()
    };
    if ctx.list_depth == 0 {
        block_break(out);
    } else if !out.ends_with('\n') {
        out.push('\n');
    }
    let indent = "  ".repeat(ctx.list_depth);
    let items = el
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|c| c.value().name() == "li");
    for (i, li) in items.enumerate() {
        let mut content = String::new();
        render_children(li, &mut content, &nested);
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        if ordered {
            out.push_str(&format!("{}{}. {}\n", indent, i + 1, content));
        } else {
            out.push_str(&format!("{}- {}\n", indent, content));
        }
    }
    if ctx.list_depth == 0 {
        block_break(out);
    }
}

fn render_table(el: ElementRef, out: &mut String, ctx: &Ctx) {
    let rows: Vec<Vec<String>> = el
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == "tr")
        .map(|tr| {
            tr.children()
                .filter_map(ElementRef::wrap)
                .filter(|c| matches!(c.value().name(), "td" | "th"))
                .map(|cell| inline(cell, ctx).replace('|', "\\|"))
                .collect::<Vec<_>>()
        })
        .filter(|r| !r.is_empty())
        .collect();
    let Some(width) = rows.iter().map(Vec::len).max() else {
        return;
    };

    block_break(out);
    for (i, row) in rows.iter().enumerate() {
        let cells = (0..width).map(|c| row.get(c).map(String::as_str).unwrap_or(""));
        out.push_str(&format!("| {} |\n", cells.format(" | ")));
        if i == 0 {
            out.push_str(&format!("|{}\n", " --- |".repeat(width)));
        }
    }
    block_break(out);
}

// ── Tests ──
