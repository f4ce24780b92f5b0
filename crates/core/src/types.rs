use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::identity::affect::EmotionState;
pub use crate::identity::traits::TraitVector;
pub use crate::identity::voice::ReplyTone;

// ── Safety ─────────────────────────────────────────────────────

/// What the stabilizer did with a proposed trait update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SafetyAction {
    Allow,
    RewriteSoft,
    Halt,
}

impl SafetyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::RewriteSoft => "rewrite-soft",
            Self::Halt => "halt",
        }
    }
}

/// Recovery state the stabilizer suggests entering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryMode {
    OverloadPrevent,
    SafetyMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyFlags {
    pub self_reference: bool,
    pub abstraction_overload: bool,
    pub loop_suspected: bool,
}

/// Advisory produced by every stabilization call.
///
/// Fields are read-only; a report is fixed once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyReport {
    flags: SafetyFlags,
    action: SafetyAction,
    note: String,
    recovery: Option<RecoveryMode>,
}

impl SafetyReport {
    pub fn allow(note: impl Into<String>) -> Self {
        Self {
            flags: SafetyFlags::default(),
            action: SafetyAction::Allow,
            note: note.into(),
            recovery: None,
        }
    }

    /// Overload: soft rewrite with a suggestion to recover.
    pub fn overload(note: impl Into<String>) -> Self {
        Self {
            flags: SafetyFlags { abstraction_overload: true, ..SafetyFlags::default() },
            action: SafetyAction::RewriteSoft,
            note: note.into(),
            recovery: Some(RecoveryMode::OverloadPrevent),
        }
    }

    /// Too many messages too fast: slow down without flagging the traits.
    pub fn busy(note: impl Into<String>) -> Self {
        Self {
            flags: SafetyFlags::default(),
            action: SafetyAction::RewriteSoft,
            note: note.into(),
            recovery: Some(RecoveryMode::OverloadPrevent),
        }
    }

    /// Oscillation: freeze the vector.
    pub fn halt_loop(note: impl Into<String>, overload: bool) -> Self {
        Self {
            flags: SafetyFlags {
                loop_suspected: true,
                abstraction_overload: overload,
                ..SafetyFlags::default()
            },
            action: SafetyAction::Halt,
            note: note.into(),
            recovery: Some(RecoveryMode::OverloadPrevent),
        }
    }

    /// Same report with the self-reference flag set from a classifier hint.
    pub fn with_self_reference(self, self_reference: bool) -> Self {
        Self { flags: SafetyFlags { self_reference, ..self.flags }, ..self }
    }

    pub fn flags(&self) -> SafetyFlags {
        self.flags
    }

    pub fn action(&self) -> SafetyAction {
        self.action
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    pub fn recovery(&self) -> Option<RecoveryMode> {
        self.recovery
    }

    pub fn is_overload(&self) -> bool {
        self.flags.abstraction_overload
    }
}

// ── Self-referent classification ───────────────────────────────

/// Who an utterance is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferentTarget {
    /// The agent itself.
    #[serde(rename = "self")]
    Agent,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "third")]
    Third,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ReferentTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "self",
            Self::User => "user",
            Self::Third => "third",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfReferentInfo {
    pub target: ReferentTarget,
    pub confidence: f32,
    pub cues: Vec<String>,
    pub note: String,
}

impl SelfReferentInfo {
    pub fn unknown(note: impl Into<String>) -> Self {
        Self { target: ReferentTarget::Unknown, confidence: 0.0, cues: Vec::new(), note: note.into() }
    }
}

/// Introspection focus derived from the referent of the agent's reply.
/// Internal only; never shown to the end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthHint {
    #[serde(rename = "self")]
    Agent,
    User,
    Third,
    Neutral,
}

impl DepthHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "self",
            Self::User => "user",
            Self::Third => "third",
            Self::Neutral => "neutral",
        }
    }
}

impl From<ReferentTarget> for DepthHint {
    fn from(t: ReferentTarget) -> Self {
        match t {
            ReferentTarget::Agent => Self::Agent,
            ReferentTarget::User => Self::User,
            ReferentTarget::Third => Self::Third,
            ReferentTarget::Unknown => Self::Neutral,
        }
    }
}

// ── Dialogue ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// One line of conversation history supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub speaker: Speaker,
    pub content: String,
}

impl DialogueTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { speaker: Speaker::User, content: content.into() }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self { speaker: Speaker::Agent, content: content.into() }
    }
}

// ── Reflection ─────────────────────────────────────────────────

/// Output bundle of the reflection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionResult {
    /// Sanitized narrative, safe to persist.
    pub reflection: String,
    /// Raw narrative from the introspection stage.
    pub introspection: String,
    pub meta_summary: String,
    /// `ok`, `filtered`, `rewrite-soft`, `halt`, or `error`.
    pub safety: String,
    pub flagged: bool,
    pub traits: TraitVector,
    pub next_focus: String,
    pub growth_adjustment: f32,
    pub report: Option<SafetyReport>,
}

/// Narrative used whenever reflection cannot produce anything usable.
pub const APOLOGY_NARRATIVE: &str =
    "I couldn't put this exchange into words just now. I'll try again next time.";

impl ReflectionResult {
    /// Neutral fallback returned when the whole pipeline gives up.
    pub fn safe_default() -> Self {
        Self {
            reflection: APOLOGY_NARRATIVE.to_string(),
            introspection: String::new(),
            meta_summary: String::new(),
            safety: "error".to_string(),
            flagged: false,
            traits: TraitVector::neutral(),
            next_focus: "general-reflection".to_string(),
            growth_adjustment: 0.5,
            report: None,
        }
    }
}

// ── Persistence records ────────────────────────────────────────

/// Durable identity state, owned by the persistence gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclePersona {
    pub traits: TraitVector,
    pub reflection: String,
    pub meta_summary: String,
    /// Rolling signal strength of recent growth adjustments.
    pub growth: f32,
    pub updated_at: Option<DateTime<Utc>>,
    /// Most recent per-axis trait deltas, oldest first.
    #[serde(default)]
    pub recent_deltas: Vec<[f32; 3]>,
}

impl Default for CyclePersona {
    fn default() -> Self {
        Self {
            traits: TraitVector::neutral(),
            reflection: String::new(),
            meta_summary: String::new(),
            growth: 0.0,
            updated_at: None,
            recent_deltas: Vec::new(),
        }
    }
}

/// One audit row per completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthEntry {
    pub traits_before: TraitVector,
    pub traits_after: TraitVector,
    pub growth_adjustment: f32,
    pub final_state: String,
    pub flags: SafetyFlags,
    pub safety_triggered: bool,
    pub flagged: bool,
    pub next_focus: String,
    #[serde(default)]
    pub signals: TurnSignals,
    pub recorded_at: DateTime<Utc>,
}

/// What a cycle observed about the turn itself. Empty for standalone reflections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnSignals {
    /// The user utterance that started the cycle.
    pub last_message: String,
    pub reply_fell_back: bool,
    pub tone: Option<ReplyTone>,
    /// Why the utterance looks like a reversal of the previous one.
    pub contradiction: Option<String>,
    /// Messages seen from this identity within the rate window at entry.
    pub message_rate: u32,
    /// Mood at cycle end.
    pub mood: Option<EmotionState>,
}

impl GrowthEntry {
    pub fn delta(&self) -> [f32; 3] {
        self.traits_after.delta_from(&self.traits_before)
    }
}

/// Everything written back at the end of a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaUpdate {
    pub traits: TraitVector,
    pub reflection: String,
    pub meta_summary: String,
    pub growth: f32,
    pub updated_at: DateTime<Utc>,
    pub entry: Option<GrowthEntry>,
}
