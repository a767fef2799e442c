//! Local HTML → Markdown conversion.
//!
//! Converts cleaned HTML with `htmd`, then applies cleanup passes. Each pass is
//! a function `&str -> String` applied in sequence.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};

use pdfpipe_shared::{PipelineError, Result};

use crate::watermark::strip_watermark_links;

/// Convert cleaned HTML to Markdown.
#[instrument(skip_all, fields(input_len = html.len()))]
pub fn html_to_markdown(html: &str) -> Result<String> {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "noscript", "iframe", "svg"])
        .build();

    let raw = converter
        .convert(html)
        .map_err(|e| PipelineError::parse(format!("htmd conversion failed: {e}")))?;

    let markdown = run_pipeline(&raw);
    debug!(raw_len = raw.len(), final_len = markdown.len(), "markdown conversion complete");
    Ok(markdown)
}

/// Run the cleanup passes over converted Markdown.
fn run_pipeline(md: &str) -> String {
    let mut result = strip_watermark_links(md).into_owned();

    result = trim_line_ends(&result);
    result = clean_blank_lines(&result);
    result = ensure_trailing_newline(&result);

    result
}

// ---------------------------------------------------------------------------
// Pass 1: Trailing whitespace (after watermark links are gone)
// ---------------------------------------------------------------------------

fn trim_line_ends(md: &str) -> String {
    md.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Pass 2: Blank lines
// ---------------------------------------------------------------------------

/// Collapse runs of 2+ blank lines into one.
fn clean_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").into_owned()
}

// ---------------------------------------------------------------------------
// Pass 3: Trailing newline
// ---------------------------------------------------------------------------

/// Ensure the text ends with exactly one newline (empty stays empty).
fn ensure_trailing_newline(md: &str) -> String {
    let trimmed = md.trim_matches('\n');
    if trimmed.is_empty() {
        return String::new();
    }
    format!("{trimmed}\n")
}
