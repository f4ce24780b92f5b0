use crate::types::{ReferentTarget, SelfReferentInfo};

/// Weight each matched cue adds to its target's score.
const CUE_WEIGHT: f32 = 1.0;
/// Multiplier on the self score when the utterance is phrased as a question.
const QUESTION_SOFTENING: f32 = 0.6;

const SELF_WORDS: &[&str] = &["i", "me", "my", "mine", "myself", "i'm", "im", "i've", "i'd", "i'll"];
const USER_WORDS: &[&str] = &["you", "your", "yours", "yourself", "you're", "you've", "you'd", "u"];
const THIRD_WORDS: &[&str] = &[
    "he", "she", "they", "them", "him", "his", "her", "their", "someone", "somebody", "people",
    "everyone",
];

// Longer cues come first so that e.g. "彼女" is not also counted as "彼".
const SELF_KANA: &[&str] = &["わたし", "あたし", "自分", "私", "僕", "ぼく", "俺"];
const USER_KANA: &[&str] = &["あなた", "お前", "きみ", "君"];
const THIRD_KANA: &[&str] = &["あの人", "彼女", "彼ら", "誰か", "みんな", "彼"];

/// Estimates who an utterance is about. Pure and stateless.
#[derive(Debug, Clone)]
pub struct SelfReferentClassifier {
    agent_name: String,
}

impl SelfReferentClassifier {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self { agent_name: agent_name.into().trim().to_lowercase() }
    }

    pub fn analyze(&self, text: &str) -> SelfReferentInfo {
        let text = text.trim();
        if text.is_empty() {
            return SelfReferentInfo::unknown("empty input");
        }

        let lowered = text.to_lowercase().replace('’', "'");
        let words = tokenize(&lowered);

        if self.names_agent(&lowered, &words) {
            return SelfReferentInfo {
                target: ReferentTarget::Agent,
                confidence: 1.0,
                cues: vec![self.agent_name.clone()],
                note: "agent addressed by name".to_string(),
            };
        }

        let mut tally = Tally::default();
        for w in &words {
            let target = if SELF_WORDS.contains(w) {
                ReferentTarget::Agent
            } else if USER_WORDS.contains(w) {
                ReferentTarget::User
            } else if THIRD_WORDS.contains(w) {
                ReferentTarget::Third
            } else {
                continue;
            };
            tally.add(target, w);
        }
        tally_kana(&lowered, &mut tally);

        let question = is_question(text);
        if question {
            tally.self_score *= QUESTION_SOFTENING;
        }

        let total = tally.self_score + tally.user_score + tally.third_score;
        if total <= 0.0 {
            return SelfReferentInfo::unknown("no referent cues");
        }

        // ties resolve in the order self, user, third
        let (target, best) = [
            (ReferentTarget::Agent, tally.self_score),
            (ReferentTarget::User, tally.user_score),
            (ReferentTarget::Third, tally.third_score),
        ]
        .into_iter()
        .fold((ReferentTarget::Unknown, 0.0f32), |acc, (t, s)| if s > acc.1 { (t, s) } else { acc });

        let mut note = format!(
            "self={:.2} user={:.2} third={:.2}",
            tally.self_score, tally.user_score, tally.third_score
        );
        if question {
            note.push_str("; question softened self score");
        }

        SelfReferentInfo {
            target,
            confidence: (best / total).clamp(0.0, 1.0),
            cues: tally.cues,
            note,
        }
    }

    fn names_agent(&self, lowered: &str, words: &[&str]) -> bool {
        if self.agent_name.is_empty() {
            return false;
        }
        if self.agent_name.is_ascii() {
            words.contains(&self.agent_name.as_str())
        } else {
            lowered.contains(&self.agent_name)
        }
    }
}

#[derive(Default)]
struct Tally {
    self_score: f32,
    user_score: f32,
    third_score: f32,
    cues: Vec<String>,
}

impl Tally {
    fn add(&mut self, target: ReferentTarget, cue: &str) {
        match target {
            ReferentTarget::Agent => self.self_score += CUE_WEIGHT,
            ReferentTarget::User => self.user_score += CUE_WEIGHT,
            ReferentTarget::Third => self.third_score += CUE_WEIGHT,
            ReferentTarget::Unknown => return,
        }
        if !self.cues.iter().any(|c| c == cue) {
            self.cues.push(cue.to_string());
        }
    }
}

fn tokenize(lowered: &str) -> Vec<&str> {
    lowered
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .collect()
}

/// Count kana/kanji cues, consuming each match so shorter cues nested in a
/// longer one are not counted twice.
fn tally_kana(lowered: &str, tally: &mut Tally) {
    let mut cues: Vec<(ReferentTarget, &str)> = SELF_KANA
        .iter()
        .map(|c| (ReferentTarget::Agent, *c))
        .chain(USER_KANA.iter().map(|c| (ReferentTarget::User, *c)))
        .chain(THIRD_KANA.iter().map(|c| (ReferentTarget::Third, *c)))
        .collect();
    cues.sort_by_key(|(_, c)| std::cmp::Reverse(c.chars().count()));

    let mut rest = lowered.to_string();
    for (target, cue) in cues {
        let hits = rest.matches(cue).count();
        for _ in 0..hits {
            tally.add(target, cue);
        }
        if hits > 0 {
            rest = rest.replace(cue, " ");
        }
    }
}

fn is_question(text: &str) -> bool {
    let trimmed = text.trim_end_matches(|c: char| c.is_whitespace() || c == '。');
    text.contains('?')
        || text.contains('？')
        || trimmed.ends_with('か')
        || trimmed.ends_with("かな")
}
