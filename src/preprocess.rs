//! Text clean-up before tokenisation, and sentence chunking for long input.
//!
//! MMS-TTS Kinyarwanda was trained on plain lower-case orthography, so the
//! pipeline strips markup, URLs and e-mail addresses, folds typographic
//! quotes onto the ASCII apostrophe used in elisions (`n'umwana`), spells
//! digits out and collapses whitespace. Case folding is left to the
//! tokenizer.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Texts longer than this (in characters) are synthesised chunk by chunk.
pub const CHUNK_MAX_CHARS: usize = 400;

// ─────────────────────────────────────────────────────────────────────────────
// Digits → words
// ─────────────────────────────────────────────────────────────────────────────

const DIGITS: [&str; 10] = [
    "zeru", "rimwe", "kabiri", "gatatu", "kane", "gatanu", "gatandatu", "karindwi", "umunani",
    "icyenda",
];

/// Read a run of digits one by one (`"2024"` → `"kabiri zeru kabiri kane"`).
pub fn digits_to_words(digits: &str) -> String {
    digits
        .chars()
        .filter_map(|c| c.to_digit(10).map(|d| DIGITS[d as usize]))
        .collect::<Vec<_>>()
        .join(" ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Regex patterns
// ─────────────────────────────────────────────────────────────────────────────

static RE_HTML: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static RE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").unwrap());
static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[\w.+-]+@[\w-]+\.[\w.-]+\b").unwrap());
static RE_QUOTES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\u{2018}\u{2019}\u{02BC}`´]").unwrap());
static RE_DOUBLE_QUOTES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\u{201C}\u{201D}«»"]"#).unwrap());
static RE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static RE_SYMBOLS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*_#~^|\\/<>\[\]{}=+]").unwrap());
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

pub fn remove_html_tags(text: &str) -> Cow<'_, str> {
    RE_HTML.replace_all(text, " ")
}

pub fn remove_urls(text: &str) -> Cow<'_, str> {
    RE_URL.replace_all(text, "")
}

pub fn remove_emails(text: &str) -> Cow<'_, str> {
    RE_EMAIL.replace_all(text, "")
}

/// Fold curly and modifier apostrophes onto `'` and drop double quotes.
pub fn normalize_quotes(text: &str) -> String {
    let text = RE_QUOTES.replace_all(text, "'");
    RE_DOUBLE_QUOTES.replace_all(&text, "").into_owned()
}

pub fn replace_numbers(text: &str) -> String {
    RE_NUMBER
        .replace_all(text, |caps: &Captures| format!(" {} ", digits_to_words(&caps[0])))
        .into_owned()
}

pub fn remove_symbols(text: &str) -> Cow<'_, str> {
    RE_SYMBOLS.replace_all(text, " ")
}

pub fn remove_extra_whitespace(text: &str) -> String {
    RE_SPACES.replace_all(text.trim(), " ").into_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// TextPreprocessor — full pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Which clean-up steps to run.
#[derive(Debug, Clone)]
pub struct PreprocessorConfig {
    pub remove_html: bool,
    pub remove_urls: bool,
    pub remove_emails: bool,
    pub normalize_quotes: bool,
    pub replace_numbers: bool,
    pub remove_symbols: bool,
    pub remove_extra_whitespace: bool,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            remove_html: true,
            remove_urls: true,
            remove_emails: true,
            normalize_quotes: true,
            replace_numbers: true,
            remove_symbols: true,
            remove_extra_whitespace: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextPreprocessor {
    pub config: PreprocessorConfig,
}

impl TextPreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PreprocessorConfig) -> Self {
        Self { config }
    }

    pub fn process(&self, text: &str) -> String {
        let cfg = &self.config;
        let mut text = text.to_string();

        if cfg.remove_html {
            text = remove_html_tags(&text).into_owned();
        }
        if cfg.remove_urls {
            text = remove_urls(&text).into_owned();
        }
        if cfg.remove_emails {
            text = remove_emails(&text).into_owned();
        }
        if cfg.normalize_quotes {
            text = normalize_quotes(&text);
        }
        if cfg.replace_numbers {
            text = replace_numbers(&text);
        }
        if cfg.remove_symbols {
            text = remove_symbols(&text).into_owned();
        }
        if cfg.remove_extra_whitespace {
            text = remove_extra_whitespace(&text);
        }
        text
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunking
// ─────────────────────────────────────────────────────────────────────────────

/// Append a comma unless the text already ends with punctuation, so every
/// chunk closes with a short pause.
pub fn ensure_punctuation(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return text.to_string();
    }
    match text.chars().last() {
        Some(c) if ".!?,;:".contains(c) => text.to_string(),
        _ => format!("{},", text),
    }
}

/// Split on sentence terminators, then pack words greedily so no chunk is
/// longer than `max_chars` (a single over-long word becomes its own chunk).
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    for sentence in text.split_terminator(['.', '!', '?']) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        if sentence.chars().count() <= max_chars {
            chunks.push(ensure_punctuation(sentence));
            continue;
        }
        let mut current = String::new();
        let mut current_len = 0usize;
        for word in sentence.split_whitespace() {
            let word_len = word.chars().count();
            if !current.is_empty() && current_len + 1 + word_len > max_chars {
                chunks.push(ensure_punctuation(&current));
                current.clear();
                current_len = 0;
            }
            if !current.is_empty() {
                current.push(' ');
                current_len += 1;
            }
            current.push_str(word);
            current_len += word_len;
        }
        if !current.trim().is_empty() {
            chunks.push(ensure_punctuation(&current));
        }
    }
    chunks
}

/// Clean `text` and, when it is longer than [`CHUNK_MAX_CHARS`], split it
/// into sentence chunks. Short text comes back as a single chunk.
pub fn prepare(preprocessor: &TextPreprocessor, text: &str) -> Vec<String> {
    let cleaned = preprocessor.process(text);
    if cleaned.is_empty() {
        return Vec::new();
    }
    if cleaned.chars().count() <= CHUNK_MAX_CHARS {
        return vec![cleaned];
    }
    chunk_text(&cleaned, CHUNK_MAX_CHARS)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
