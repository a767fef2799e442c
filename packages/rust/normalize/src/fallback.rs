//! Regex-only normalizer. Strips noise but keeps the converter's markup.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};

use pdfpipe_shared::Result;

use crate::HtmlNormalizer;
use crate::watermark::strip_watermark_links;

/// Removes scripts, styles and presentation attributes without rebuilding blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexNormalizer;

impl HtmlNormalizer for RegexNormalizer {
    fn name(&self) -> &'static str {
        "regex"
    }

    #[instrument(skip_all, fields(input_len = html.len()))]
    fn normalize(&self, html: &str) -> Result<String> {
        static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid regex")
        });
        static STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("valid regex")
        });
        static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r#"(?i)\s(?:style|class)\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#)
                .expect("valid regex")
        });
        static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

        let out = strip_watermark_links(html);
        let out = SCRIPT_RE.replace_all(&out, "");
        let out = STYLE_RE.replace_all(&out, "");
        let out = ATTR_RE.replace_all(&out, "");
        let out = WS_RE.replace_all(&out, " ");
        let out = out.trim().to_string();

        debug!(output_len = out.len(), "stripped html");
        Ok(out)
    }
}
