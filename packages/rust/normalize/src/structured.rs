//! DOM-based normalizer: rebuilds the document from its text blocks.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};

use pdfpipe_shared::Result;

use crate::reflow::normalize_text;
use crate::watermark::{is_watermark_href, is_watermark_text, strip_watermark_links};
use crate::{Block, BlockTag, HtmlNormalizer, render_document};

static BLOCK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p, h1, h2, h3, h4, h5, h6").expect("valid selector"));

static IMG_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img[src]").expect("valid selector"));

/// Elements whose text never reaches the output.
const SKIPPED_ELEMENTS: [&str; 3] = ["script", "style", "noscript"];

/// Rebuilds cleaned HTML from paragraph and heading blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredNormalizer;

impl HtmlNormalizer for StructuredNormalizer {
    fn name(&self) -> &'static str {
        "structured"
    }

    #[instrument(skip_all, fields(input_len = html.len()))]
    fn normalize(&self, html: &str) -> Result<String> {
        let source = strip_watermark_links(html);
        let doc = Html::parse_document(&source);

        let cover = find_cover(&doc);
        let blocks = collect_blocks(&doc);

        debug!(
            blocks = blocks.len(),
            has_cover = cover.is_some(),
            "rebuilt html blocks"
        );

        let rendered = render_document(cover, &blocks);
        Ok(strip_watermark_links(&rendered).into_owned())
    }
}

/// First inline `data:image/` source in the document.
fn find_cover(doc: &Html) -> Option<&str> {
    doc.select(&IMG_SELECTOR)
        .filter_map(|img| img.value().attr("src"))
        .find(|src| src.starts_with("data:image/"))
}

/// Block candidates in document order, classified, reflowed and filtered.
pub(crate) fn collect_blocks(doc: &Html) -> Vec<Block> {
    doc.select(&BLOCK_SELECTOR)
        .filter(|el| !el.ancestors().filter_map(ElementRef::wrap).any(is_skipped))
        .filter_map(|el| {
            let text = normalize_text(&block_text(el));
            if is_droppable(&text) {
                return None;
            }
            Some(Block {
                tag: classify(&el),
                text,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Infer the output tag from the class name, then from the element itself.
///
/// Levels are checked from 1 to 4. A level matches on a delimited
/// `heading[-_ ]N` or anywhere `heading-N` appears in the class.
fn classify(el: &ElementRef) -> BlockTag {
    static LEVEL_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
        (1..=4)
            .map(|level| Regex::new(&format!(r"\bheading[-_ ]?{level}\b")).expect("valid regex"))
            .collect()
    });
    static BARE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\bheading\b").expect("valid regex"));

    let class = el.value().attr("class").unwrap_or_default().to_lowercase();

    for (level, re) in (1u8..).zip(LEVEL_RES.iter()) {
        if re.is_match(&class) || class.contains(&format!("heading-{level}")) {
            return BlockTag::heading(level);
        }
    }
    if BARE_RE.is_match(&class) {
        return BlockTag::H2;
    }

    match el.value().name() {
        "h1" => BlockTag::H1,
        "h2" => BlockTag::H2,
        "h3" => BlockTag::H3,
        "h4" | "h5" | "h6" => BlockTag::H4,
        _ => BlockTag::P,
    }
}

fn is_skipped(el: ElementRef) -> bool {
    let element = el.value();
    if SKIPPED_ELEMENTS.contains(&element.name()) {
        return true;
    }
    element.name() == "a" && element.attr("href").is_some_and(is_watermark_href)
}

/// Empty, punctuation-only and watermark blocks carry no content.
fn is_droppable(text: &str) -> bool {
    !text.chars().any(char::is_alphanumeric) || is_watermark_text(text)
}

// ---------------------------------------------------------------------------
// Text runs
// ---------------------------------------------------------------------------

/// Join a block's child runs, keeping the converter's own word boundaries.
///
/// Each direct child (text node or inline element) is one run. A run that is
/// all whitespace, or starts with whitespace, separates words. Runs that touch
/// without whitespace are glued together.
fn block_text(block: ElementRef) -> String {
    let mut out = String::new();
    for child in block.children() {
        let mut run = String::new();
        if let Some(text) = child.value().as_text() {
            run.push_str(text);
        } else if let Some(el) = ElementRef::wrap(child) {
            element_text(el, &mut run);
        }
        push_run(&mut out, &run);
    }
    out
}

fn push_run(out: &mut String, run: &str) {
    if run.is_empty() {
        return;
    }
    let body = run.trim_start();
    if body.len() < run.len() && !out.is_empty() && !out.ends_with(char::is_whitespace) {
        out.push(' ');
    }
    out.push_str(body);
}

fn element_text(el: ElementRef, out: &mut String) {
    if el.value().name() == "br" {
        out.push(' ');
        return;
    }
    if is_skipped(el) {
        return;
    }
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            element_text(child_el, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(html: &str) -> String {
        StructuredNormalizer.normalize(html).expect("normalize")
    }

    fn body_of(html: &str) -> &str {
        let start = html.find("<body>").expect("body open") + "<body>".len();
        let end = html.rfind("</body>").expect("body close");
        &html[start..end]
    }

    #[test]
    fn rebuilds_headings_and_paragraphs() {
        let html = r#"<html><head><style>p { color: red }</style></head><body>
            <p class="heading heading-1"><span>Chapter One</span></p>
            <p class="paragraph"><span>It was a</span><span> dark night</span></p>
            <p class="paragraph heading_3">Sub part</p>
            <p class="heading">Untitled</p>
            <h5>Small</h5>
        </body></html>"#;

        let out = normalize(html);
        assert_eq!(
            body_of(&out),
            "<h1>Chapter One</h1><p>It was a dark night</p><h3>Sub part</h3><h2>Untitled</h2><h4>Small</h4>"
        );
    }

    #[test]
    fn heading_class_matches_by_containment() {
        let html = r#"<body>
            <p class="paragraph subheading-1">Title</p>
            <p class="subheading-2">Part</p>
            <p class="heading-10">Ten</p>
            <p class="heading-3 heading-1">Lowest wins</p>
            <p class="subheading">Plain</p>
        </body>"#;

        assert_eq!(
            body_of(&normalize(html)),
            "<h1>Title</h1><h2>Part</h2><h1>Ten</h1><h1>Lowest wins</h1><p>Plain</p>"
        );
    }

    #[test]
    fn joins_runs_without_whitespace() {
        let html = r#"<p class="paragraph"><span>won</span><span>derful</span><span> day</span></p>"#;
        assert_eq!(body_of(&normalize(html)), "<p>wonderful day</p>");
    }

    #[test]
    fn whitespace_only_run_is_a_boundary() {
        let html = r#"<p><span>left</span><span> </span><span>right</span><br>next</p>"#;
        assert_eq!(body_of(&normalize(html)), "<p>left right next</p>");
    }

    #[test]
    fn strips_scripts_and_watermarks() {
        let html = r#"<body>
            <script>var x = 1;</script>
            <noscript><p>enable js</p></noscript>
            <p>Keep <a href="https://OceanofPDF.com/x">OceanofPDF</a>this</p>
            <p>Get more at OceanofPDF.com</p>
            <p>. . .</p>
            <p>   </p>
        </body>"#;

        let out = normalize(html);
        assert_eq!(body_of(&out), "<p>Keep this</p>");
        assert!(!out.to_lowercase().contains("oceanofpdf"));
    }

    #[test]
    fn keeps_first_inline_cover_image() {
        let html = r#"<body>
            <img src="https://example.com/remote.png">
            <img src="data:image/png;base64,AAAA">
            <img src="data:image/jpeg;base64,BBBB">
            <p>Text</p>
        </body>"#;

        let out = normalize(html);
        assert_eq!(
            body_of(&out),
            r#"<img src="data:image/png;base64,AAAA" alt="Cover"><p>Text</p>"#
        );
    }

    #[test]
    fn reflows_block_text() {
        let html = r#"<p>Hello , wor d ( 1 000 items )</p>"#;
        assert_eq!(body_of(&normalize(html)), "<p>Hello, word (1000 items)</p>");
    }

    #[test]
    fn empty_input_yields_empty_body() {
        let out = normalize("");
        assert_eq!(
            out,
            r#"<!doctype html><html><head><meta charset="utf-8"></head><body></body></html>"#
        );
    }

    #[test]
    fn is_idempotent_on_own_output() {
        let html = r#"<body>
            <img src="data:image/png;base64,AAAA">
            <p class="heading-2"><span>T HE</span><span> BEGINNING</span></p>
            <p class="paragraph"><span>Fish &amp; chips</span><span> , t the</span><span> end &lt;3</span></p>
            <p class="paragraph">ssomething exam- ple 1 2 3</p>
        </body>"#;

        let once = normalize(html);
        let twice = normalize(&once);
        assert_eq!(once, twice);
        assert!(once.contains("<h2>THE BEGINNING</h2>"));
        assert!(once.contains("Fish &amp; chips, the end &lt;3"));
    }
}
