//! Text reflow corrections for converted block text.
//!
//! Each correction is a function `&str -> String` applied in a fixed order.
//! The sequence is repeated until nothing changes, so the result is stable
//! under re-normalization.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Apply every correction until the text stops changing.
pub fn normalize_text(input: &str) -> String {
    let mut current = run_passes(input);
    loop {
        let next = run_passes(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn run_passes(input: &str) -> String {
    let mut text = replace_artifacts(input);

    text = collapse_whitespace(&text);
    text = tighten_punctuation(&text);
    text = join_digit_groups(&text);
    text = join_hyphen_breaks(&text);
    text = collapse_repeated_leading_letter(&text);
    text = collapse_doubled_consonant(&text);
    text = join_split_capitals(&text);
    text = join_trailing_letter(&text);
    text = join_leading_letter(&text);

    collapse_whitespace(&text)
}

// ---------------------------------------------------------------------------
// Pass 1: Unicode artifacts
// ---------------------------------------------------------------------------

/// NBSP and control chars become spaces; soft hyphens, zero-width marks and
/// replacement chars disappear.
fn replace_artifacts(text: &str) -> String {
    text.chars()
        .filter(|&c| !matches!(c, '\u{ad}' | '\u{200b}'..='\u{200d}' | '\u{feff}' | '\u{fffd}'))
        .map(|c| match c {
            '\u{a0}' => ' ',
            c if c.is_ascii_control() => ' ',
            c => c,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Pass 2: Whitespace
// ---------------------------------------------------------------------------

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Pass 3: Punctuation and brackets
// ---------------------------------------------------------------------------

/// `word ,` → `word,`, `( x )` → `(x)`, `it' s` → `it's`.
fn tighten_punctuation(text: &str) -> String {
    static BEFORE_PUNCT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s+([,.;:!?])").expect("valid regex"));
    static AFTER_OPEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"([(\[{])\s+").expect("valid regex"));
    static BEFORE_CLOSE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s+([)\]}])").expect("valid regex"));
    static APOSTROPHE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(['\x{2019}])\s+([a-z])").expect("valid regex"));

    let text = BEFORE_PUNCT_RE.replace_all(text, "$1");
    let text = AFTER_OPEN_RE.replace_all(&text, "$1");
    let text = BEFORE_CLOSE_RE.replace_all(&text, "$1");
    APOSTROPHE_RE.replace_all(&text, "$1$2").into_owned()
}

// ---------------------------------------------------------------------------
// Pass 4: Digit groups
// ---------------------------------------------------------------------------

/// `1 2 3` → `123` and `1 000` → `1000`.
fn join_digit_groups(text: &str) -> String {
    static SPACED_DIGITS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b(?:[0-9]\s+){2,}[0-9]\b").expect("valid regex"));
    static THOUSANDS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b([0-9])\s+([0-9]{3,})\b").expect("valid regex"));

    let text = SPACED_DIGITS_RE.replace_all(text, |caps: &Captures| {
        caps[0].split_whitespace().collect::<String>()
    });
    THOUSANDS_RE.replace_all(&text, "$1$2").into_owned()
}

// ---------------------------------------------------------------------------
// Pass 5: Hyphenated line breaks
// ---------------------------------------------------------------------------

/// `exam- ple` → `exam-ple`.
fn join_hyphen_breaks(text: &str) -> String {
    static HYPHEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)-\s+([a-z])").expect("valid regex"));

    HYPHEN_RE.replace_all(text, "-$1").into_owned()
}

// ---------------------------------------------------------------------------
// Pass 6: Letter doubling
// ---------------------------------------------------------------------------

/// `t the` → `the`: a lone letter repeated as the next word's first letter.
fn collapse_repeated_leading_letter(text: &str) -> String {
    static REPEAT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\b([A-Za-z])\s+([A-Za-z])([A-Za-z]{2,})\b").expect("valid regex")
    });

    REPEAT_RE
        .replace_all(text, |caps: &Captures| {
            if caps[1] == caps[2] {
                format!("{}{}", &caps[2], &caps[3])
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// `ssomething` → `something`.
fn collapse_doubled_consonant(text: &str) -> String {
    static DOUBLED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\b([bcdfghjklmnpqrtvwxyz])([bcdfghjklmnpqrtvwxyz])([a-z]{3,})\b")
            .expect("valid regex")
    });

    DOUBLED_RE
        .replace_all(text, |caps: &Captures| {
            if caps[1] == caps[2] {
                format!("{}{}", &caps[1], &caps[3])
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Pass 7: Single-letter run-ons
// ---------------------------------------------------------------------------

/// `T HE` → `THE`.
fn join_split_capitals(text: &str) -> String {
    static CAPS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b([A-Z])\s+([A-Z]{2,})\b").expect("valid regex"));

    CAPS_RE.replace_all(text, "$1$2").into_owned()
}

/// `wor d` → `word`. `a` and `i` are real words and stay separate.
fn join_trailing_letter(text: &str) -> String {
    static TRAILING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b([a-z]{3,})\s+([b-hj-z])\b").expect("valid regex"));

    TRAILING_RE.replace_all(text, "$1$2").into_owned()
}

/// `b ook` → `book`, again sparing `a` and `i`.
fn join_leading_letter(text: &str) -> String {
    static LEADING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b([b-hj-z])\s+([a-z]{2,})\b").expect("valid regex"));

    LEADING_RE.replace_all(text, "$1$2").into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
