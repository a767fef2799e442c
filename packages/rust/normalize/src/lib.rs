//! Cleanup of converter-produced HTML.
//!
//! Raw HTML from the conversion service is reduced to a minimal document: an
//! optional cover image followed by `h1`..`h4` and `p` blocks in source order,
//! each with its text reflowed to undo extraction damage.
//!
//! Two strategies implement [`HtmlNormalizer`]:
//! - [`StructuredNormalizer`]: DOM walk with block reconstruction
//! - [`RegexNormalizer`]: degraded stripping without reconstruction
//!
//! [`markdown`] holds the local HTML → Markdown conversion.

mod fallback;
pub mod markdown;
mod reflow;
mod structured;
mod watermark;

use std::sync::Arc;

use pdfpipe_shared::{NormalizerKind, Result};

pub use fallback::RegexNormalizer;
pub use structured::StructuredNormalizer;

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// Turns raw converted HTML into cleaned HTML.
///
/// Implementations must be idempotent: normalizing their own output again
/// yields the same document.
pub trait HtmlNormalizer: Send + Sync {
    /// Short strategy name for logs.
    fn name(&self) -> &'static str;

    /// Normalize a full HTML document.
    fn normalize(&self, html: &str) -> Result<String>;
}

/// Build the configured normalizer strategy.
pub fn normalizer_for(kind: NormalizerKind) -> Arc<dyn HtmlNormalizer> {
    match kind {
        NormalizerKind::Structured => Arc::new(StructuredNormalizer),
        NormalizerKind::Regex => Arc::new(RegexNormalizer),
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Semantic tag of an emitted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    H1,
    H2,
    H3,
    H4,
    P,
}

impl BlockTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::H1 => "h1",
            Self::H2 => "h2",
            Self::H3 => "h3",
            Self::H4 => "h4",
            Self::P => "p",
        }
    }

    /// Heading tag for a level, clamped to `h1`..`h4`.
    pub fn heading(level: u8) -> Self {
        match level {
            0 | 1 => Self::H1,
            2 => Self::H2,
            3 => Self::H3,
            _ => Self::H4,
        }
    }
}

/// One block of cleaned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub tag: BlockTag,
    pub text: String,
}

/// Render the cleaned document shell around an optional cover and blocks.
pub fn render_document(cover: Option<&str>, blocks: &[Block]) -> String {
    let mut body = String::new();

    if let Some(src) = cover {
        body.push_str(&format!(r#"<img src="{}" alt="Cover">"#, escape_attr(src)));
    }

    for block in blocks {
        let tag = block.tag.as_str();
        body.push_str(&format!("<{tag}>{}</{tag}>", escape_text(&block.text)));
    }

    format!(r#"<!doctype html><html><head><meta charset="utf-8"></head><body>{body}</body></html>"#)
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_escapes_text_and_attributes() {
        let blocks = vec![
            Block {
                tag: BlockTag::H1,
                text: "Fish & Chips".into(),
            },
            Block {
                tag: BlockTag::P,
                text: "a < b > c".into(),
            },
        ];
        let html = render_document(Some("data:image/png;base64,AA\"A"), &blocks);

        assert!(html.starts_with("<!doctype html><html><head><meta charset=\"utf-8\"></head><body>"));
        assert!(html.contains(r#"<img src="data:image/png;base64,AA&quot;A" alt="Cover">"#));
        assert!(html.contains("<h1>Fish &amp; Chips</h1>"));
        assert!(html.contains("<p>a &lt; b &gt; c</p>"));
        assert!(html.ends_with("</body></html>"));
    }

    #[test]
    fn heading_levels_clamp() {
        assert_eq!(BlockTag::heading(1), BlockTag::H1);
        assert_eq!(BlockTag::heading(4), BlockTag::H4);
        assert_eq!(BlockTag::heading(6), BlockTag::H4);
    }

    #[test]
    fn normalizer_for_picks_strategy() {
        assert_eq!(normalizer_for(NormalizerKind::Structured).name(), "structured");
        assert_eq!(normalizer_for(NormalizerKind::Regex).name(), "regex");
    }
}
