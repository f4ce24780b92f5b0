use regex::Regex;
use std::sync::LazyLock;

/// Glyph that replaces every denied term.
pub const PLACEHOLDER: &str = "■";

/// Latin terms match on word boundaries; CJK terms have no boundaries to match on.
static DENIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:kill\s+yourself|kys|suicide|murder|die)\b|死ね|殺す|自殺")
        .expect("denylist pattern is valid")
});

/// Result of a plain-text safety scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scrubbed {
    pub text: String,
    pub hits: usize,
}

impl Scrubbed {
    pub fn flagged(&self) -> bool {
        self.hits > 0
    }
}

/// Replace every denied term with [`PLACEHOLDER`].
pub fn scrub(text: &str) -> Scrubbed {
    let hits = DENIED.find_iter(text).count();
    if hits == 0 {
        return Scrubbed { text: text.to_string(), hits };
    }
    Scrubbed { text: DENIED.replace_all(text, PLACEHOLDER).into_owned(), hits }
}
