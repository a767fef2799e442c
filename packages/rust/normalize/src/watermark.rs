//! Vendor watermark detection.
//!
//! Some converted books carry an "OceanofPDF.com" watermark, either as links
//! or as markdown-link text split across runs.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Remove the split markdown-link form: `[OceanofPD](…)[F](…)[.](…)[com](…)`.
pub(crate) fn strip_watermark_links(text: &str) -> Cow<'_, str> {
    static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
        let target = r"\(\s*https?://oceanofpdf\.com/?\s*\)";
        let pattern = [r"OceanofPD", r"F", r"\.", r"com"]
            .iter()
            .map(|label| format!(r"\[\s*{label}\s*\]{target}"))
            .collect::<Vec<_>>()
            .join(r"\s*");
        Regex::new(&format!("(?i){pattern}")).expect("valid regex")
    });

    LINK_RE.replace_all(text, "")
}

/// Whether a block's text mentions the watermark.
pub(crate) fn is_watermark_text(text: &str) -> bool {
    text.to_lowercase().contains("oceanofpd")
}

/// Whether a link target points at the watermark site.
pub(crate) fn is_watermark_href(href: &str) -> bool {
    href.to_lowercase().contains("oceanofpdf.com")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_split_markdown_links() {
        let input = "Before [OceanofPD](https://oceanofpdf.com)[F](https://oceanofpdf.com/) \
                     [ . ](http://OceanofPDF.com)[com](https://oceanofpdf.com) after";
        assert_eq!(strip_watermark_links(input), "Before  after");
    }

    #[test]
    fn leaves_other_links_alone() {
        let input = "[docs](https://example.com)";
        assert_eq!(strip_watermark_links(input), input);
    }

    #[test]
    fn detects_watermark_text_and_links() {
        assert!(is_watermark_text("Visit OceanofPDF.com for more"));
        assert!(!is_watermark_text("An ocean of words"));
        assert!(is_watermark_href("https://OceanOfPDF.com/book"));
        assert!(!is_watermark_href("https://example.com"));
    }
}
