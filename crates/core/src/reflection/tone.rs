use regex::Regex;
use std::sync::LazyLock;

/// Final voice pass applied to a narrative before it is stored.
pub trait NarrativeTone: Send + Sync {
    fn normalize(&self, text: &str) -> String;
}

static BANGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([!！?？])[!！?？]+").expect("punctuation pattern is valid"));
static EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*|__").expect("emphasis pattern is valid"));
static SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("whitespace pattern is valid"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("blank line pattern is valid"));

/// Quiet, even register: no shouting punctuation, no markdown emphasis.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTone;

impl NarrativeTone for PlainTone {
    fn normalize(&self, text: &str) -> String {
        let text = BANGS.replace_all(text, "$1");
        let text = EMPHASIS.replace_all(&text, "");
        let text = SPACES.replace_all(&text, " ");
        let text = BLANK_LINES.replace_all(&text, "\n\n");
        text.lines().map(str::trim).collect::<Vec<_>>().join("\n").trim().to_string()
    }
}
