//! Heuristic check for a user reversing what they said in their previous
//! message: a stance flip, an intent pair swapped, a sudden pile of
//! negations, or the same sentence repeated with a negation added.
//!
//! Japanese cues are matched as substrings of whitespace-free text; English
//! cues are matched as whole words.

use regex::Regex;
use std::sync::LazyLock;

use crate::types::{DialogueTurn, Speaker};

const POSITIVE: &[&str] = &[
    "そう思う",
    "賛成",
    "いいと思う",
    "そうだね",
    "はい",
    "同意",
    "なるほど",
    "理解した",
    "わかる",
    "好き",
    "興味ある",
];

const NEGATIVE: &[&str] = &[
    "そう思わない",
    "違う",
    "反対",
    "よくない",
    "だめ",
    "無理",
    "いや",
    "納得できない",
    "嫌い",
    "わからない",
];

const NEGATION_MARKERS: &[&str] = &["違う", "いや", "無理", "否定", "そんなことない", "だめ", "嫌"];

/// Intent pairs whose sides flip between messages.
const INTENT_PAIRS: &[(&str, &str)] = &[
    ("できる", "できない"),
    ("行く", "行かない"),
    ("やる", "やらない"),
    ("続ける", "やめる"),
    ("i will", "i won't"),
    ("keep going", "give up"),
];

/// Negations piling up by this many markers at once count as a reversal.
const NEGATION_SURGE: usize = 3;

static POSITIVE_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:ok|okay|yes|agreed?|i agree|makes sense|sounds good|i like (?:it|that)|i understand)\b")
        .expect("positive stance pattern is valid")
});

static NEGATIVE_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:no|nope|disagree|no way|not really|i don't (?:agree|like|think so|understand)|i hate)\b")
        .expect("negative stance pattern is valid")
});

struct Normalized {
    /// Lowercased, punctuation dropped, whitespace collapsed to single spaces.
    spaced: String,
    /// Same without any whitespace.
    compact: String,
}

impl Normalized {
    fn new(text: &str) -> Self {
        let cleaned: String = text
            .to_lowercase()
            .chars()
            .filter(|c| !matches!(c, '。' | ',' | '.' | '!' | '?' | '！' | '？' | '…' | '、'))
            .collect();
        let spaced = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        let compact = spaced.chars().filter(|c| !c.is_whitespace()).collect();
        Self { spaced, compact }
    }

    fn is_empty(&self) -> bool {
        self.compact.is_empty()
    }

    fn contains(&self, cue: &str) -> bool {
        if cue.is_ascii() { self.spaced.contains(cue) } else { self.compact.contains(cue) }
    }

    fn positive(&self) -> bool {
        POSITIVE.iter().any(|p| self.compact.contains(p)) || POSITIVE_EN.is_match(&self.spaced)
    }

    fn negative(&self) -> bool {
        NEGATIVE.iter().any(|n| self.compact.contains(n)) || NEGATIVE_EN.is_match(&self.spaced)
    }

    fn negations(&self) -> usize {
        NEGATION_MARKERS.iter().filter(|m| self.compact.contains(**m)).count()
    }

    fn negated(&self) -> bool {
        self.compact.contains("ない") || self.spaced.contains(" not") || self.spaced.contains("n't")
    }
}

/// The user's most recent turn before the current utterance.
pub fn previous_user_turn(history: &[DialogueTurn]) -> Option<&str> {
    history.iter().rev().find(|t| t.speaker == Speaker::User).map(|t| t.content.as_str())
}

/// Compare the current message with the previous one. Returns a short note
/// describing the reversal, or `None` when the two are consistent.
pub fn detect(previous: &str, current: &str) -> Option<String> {
    let last = Normalized::new(previous);
    let now = Normalized::new(current);
    if last.is_empty() || now.is_empty() {
        return None;
    }

    if (last.positive() && now.negative()) || (last.negative() && now.positive()) {
        return Some(format!("stance reversed (\"{}\" -> \"{}\")", previous.trim(), current.trim()));
    }

    for (yes, no) in INTENT_PAIRS {
        if (last.contains(yes) && now.contains(no)) || (last.contains(no) && now.contains(yes)) {
            return Some(format!("intent reversed ({yes}/{no})"));
        }
    }

    if now.negations() >= last.negations() + NEGATION_SURGE {
        return Some("negations piled up".to_string());
    }

    let extended = now.compact != last.compact && now.compact.starts_with(&last.compact);
    if extended && now.negated() && !last.negated() {
        return Some("same statement turned negative".to_string());
    }
    None
}
