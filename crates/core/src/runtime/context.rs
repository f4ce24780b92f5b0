use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::CycleState;
use crate::types::{
    CyclePersona, DepthHint, DialogueTurn, EmotionState, ReflectionResult, ReplyTone, SafetyReport,
    SelfReferentInfo, TraitVector, TurnSignals,
};

/// One inbound utterance plus what the caller knows about the conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleInput {
    pub identity: String,
    pub utterance: String,
    /// Prior turns, oldest first. Excludes `utterance`.
    #[serde(default)]
    pub history: Vec<DialogueTurn>,
    /// Running summary returned by the previous cycle.
    #[serde(default)]
    pub summary: Option<String>,
    /// Set by an upstream risk classifier.
    #[serde(default)]
    pub risk_flagged: bool,
}

impl CycleInput {
    pub fn new(identity: impl Into<String>, utterance: impl Into<String>) -> Self {
        Self { identity: identity.into(), utterance: utterance.into(), ..Self::default() }
    }

    pub fn with_history(mut self, history: Vec<DialogueTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn flagged(mut self) -> Self {
        self.risk_flagged = true;
        self
    }
}

/// Mutable state of a single cycle. Created at entry, consumed at exit.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub cycle_id: Uuid,
    pub input: CycleInput,
    /// Snapshot loaded at cycle entry.
    pub persona: CyclePersona,
    /// Working trait vector.
    pub traits: TraitVector,
    pub emotion: EmotionState,
    pub entry_report: SafetyReport,
    /// Messages from this identity inside the usage guard's rate window.
    pub message_rate: u32,
    pub reply: Option<String>,
    pub reply_fell_back: bool,
    pub tone: Option<ReplyTone>,
    pub contradiction: Option<String>,
    /// Last fixed message emitted by a recovery state.
    pub notice: Option<String>,
    pub reflect_narrative: Option<String>,
    pub depth_hint: Option<DepthHint>,
    pub self_referent: Option<SelfReferentInfo>,
    pub reflection: Option<ReflectionResult>,
    pub summary: Option<String>,
    pub overload_attempts: u32,
    pub safety_attempts: u32,
    /// Calm after each recovery attempt.
    pub calm_trace: Vec<f32>,
    pub safety_triggered: bool,
    /// Handler states executed, in order.
    pub trace: Vec<CycleState>,
    pub final_state: CycleState,
}

impl CycleContext {
    pub fn new(cycle_id: Uuid, input: CycleInput, persona: CyclePersona) -> Self {
        let summary = input.summary.clone().filter(|s| !s.trim().is_empty());
        Self {
            cycle_id,
            traits: persona.traits.coerce(),
            persona,
            emotion: EmotionState::default(),
            entry_report: SafetyReport::allow("not checked"),
            message_rate: 0,
            reply: None,
            reply_fell_back: false,
            tone: None,
            contradiction: None,
            notice: None,
            reflect_narrative: None,
            depth_hint: None,
            self_referent: None,
            reflection: None,
            summary,
            overload_attempts: 0,
            safety_attempts: 0,
            calm_trace: Vec::new(),
            safety_triggered: false,
            trace: Vec::new(),
            final_state: CycleState::Idle,
            input,
        }
    }

    pub fn steps(&self) -> usize {
        self.trace.len()
    }

    pub fn with_message_rate(mut self, rate: u32) -> Self {
        self.message_rate = rate;
        self
    }

    /// What the growth log records about this turn.
    pub fn signals(&self) -> TurnSignals {
        TurnSignals {
            last_message: self.input.utterance.clone(),
            reply_fell_back: self.reply_fell_back,
            tone: self.tone,
            contradiction: self.contradiction.clone(),
            message_rate: self.message_rate,
            mood: Some(self.emotion),
        }
    }

    /// Drop hints left over from an earlier pass through the cycle.
    pub fn clear_hints(&mut self) {
        self.reflect_narrative = None;
        self.depth_hint = None;
        self.self_referent = None;
    }
}

/// What a completed cycle hands back to the caller.
///
/// Optional parts are always present in serialized form: an empty summary,
/// an empty recent window, and `null` self-reference info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub cycle_id: Uuid,
    pub identity: String,
    pub reply: String,
    /// The reply is the fixed apology because generation failed.
    #[serde(default)]
    pub reply_fell_back: bool,
    #[serde(default)]
    pub tone: Option<ReplyTone>,
    #[serde(default)]
    pub contradiction: Option<String>,
    pub final_state: CycleState,
    pub trace: Vec<CycleState>,
    pub traits_before: TraitVector,
    pub traits: TraitVector,
    pub emotion: EmotionState,
    pub report: SafetyReport,
    pub reflection: Option<ReflectionResult>,
    pub summary: String,
    pub recent: Vec<DialogueTurn>,
    pub self_referent: Option<SelfReferentInfo>,
    pub persisted: bool,
}

impl CycleOutcome {
    pub fn steps(&self) -> usize {
        self.trace.len()
    }
}

/// How a call to the orchestrator ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleDisposition {
    Completed(Box<CycleOutcome>),
    /// The usage guard refused the cycle. Nothing was loaded or saved.
    Denied { identity: String },
    /// The caller cancelled. State was still persisted.
    CallerGone { cycle_id: Uuid },
}

impl CycleDisposition {
    pub fn outcome(&self) -> Option<&CycleOutcome> {
        match self {
            Self::Completed(o) => Some(o.as_ref()),
            _ => None,
        }
    }

    pub fn into_outcome(self) -> Option<CycleOutcome> {
        match self {
            Self::Completed(o) => Some(*o),
            _ => None,
        }
    }
}
