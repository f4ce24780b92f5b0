use persona_llm::provider::{CompletionRequest, LlmProvider};
use serde_json::Value;
use std::sync::Arc;

use super::introspect::introspect;
use super::meta::{MetaProposal, meta_reflect};
use super::parse::{extract_object, lenient_f32, lenient_text};
use super::reflect::{Reflection, reflect};
use super::stage::{StageOutcome, narrate};
use super::tone::{NarrativeTone, PlainTone};
use crate::cognition::self_referent::SelfReferentClassifier;
use crate::config::PersonaCfg;
use crate::memory::{PersonaStore, load_or_neutral, save_within};
use crate::safety::denylist::scrub;
use crate::safety::{StabilizerCfg, composite_with_history};
use crate::types::{
    APOLOGY_NARRATIVE, DepthHint, DialogueTurn, GrowthEntry, PersonaUpdate, ReflectionResult,
    SafetyAction, Speaker, TraitVector, TurnSignals,
};

const CONSOLIDATE_SYSTEM: &str = "You maintain the long-term self-understanding of an AI persona. \
Read the context and answer with one JSON object and nothing else: \
{\"reflection\": string, \"metaSummary\": string, \
\"traits\": {\"calm\": number, \"empathy\": number, \"curiosity\": number}}. \
Trait values are between 0 and 1 and should move only slightly from the current ones.";

/// What consolidation needs to know about the persona and the exchange.
#[derive(Debug, Clone, Copy)]
pub struct ConsolidationInput<'a> {
    pub traits: TraitVector,
    pub growth: f32,
    pub prior_summary: &'a str,
    /// Oldest first.
    pub recent_deltas: &'a [[f32; 3]],
    pub dialogue: &'a [DialogueTurn],
    /// Output of the introspection stage when running inside a cycle.
    pub introspection: Option<&'a str>,
}

/// Reflect → Introspect → Meta-Reflect, plus consolidation of the result
/// into the persona's traits.
pub struct ReflectionPipeline {
    narrator: Arc<dyn LlmProvider>,
    tone: Arc<dyn NarrativeTone>,
    classifier: SelfReferentClassifier,
    cfg: Arc<PersonaCfg>,
}

impl ReflectionPipeline {
    pub fn new(narrator: Arc<dyn LlmProvider>, cfg: Arc<PersonaCfg>) -> Self {
        Self {
            narrator,
            tone: Arc::new(PlainTone),
            classifier: SelfReferentClassifier::new(cfg.agent_name.clone()),
            cfg,
        }
    }

    pub fn with_tone(mut self, tone: Arc<dyn NarrativeTone>) -> Self {
        self.tone = tone;
        self
    }

    pub fn classifier(&self) -> &SelfReferentClassifier {
        &self.classifier
    }

    pub async fn reflect(&self, user: &str, reply: &str, growth_avg: Option<f32>) -> Reflection {
        reflect(self.narrator.as_ref(), &self.classifier, user, reply, growth_avg, self.cfg.llm_timeout())
            .await
    }

    pub async fn introspect(
        &self,
        narrative: &str,
        hint: DepthHint,
        traits: &TraitVector,
        summary: Option<&str>,
    ) -> StageOutcome<String> {
        introspect(self.narrator.as_ref(), narrative, hint, traits, summary, self.cfg.llm_timeout()).await
    }

    pub async fn meta_reflect(&self, introspection: &str, traits: &TraitVector) -> StageOutcome<MetaProposal> {
        meta_reflect(self.narrator.as_ref(), introspection, traits, self.cfg.llm_timeout()).await
    }

    /// Fold an exchange into the persona: propose traits, stabilize them
    /// strictly, run Meta-Reflect, then normalize and scrub the narrative.
    /// Every failure degrades to a fallback value; this never errors.
    pub async fn consolidate(&self, input: ConsolidationInput<'_>) -> ReflectionResult {
        let prev = input.traits.coerce();
        let fallback_narrative = || {
            input
                .introspection
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(APOLOGY_NARRATIVE)
                .to_string()
        };

        let request = CompletionRequest::prompt(CONSOLIDATE_SYSTEM, self.context_prompt(&input))
            .with_limits(600, 0.5);
        let (raw_reflection, proposed_summary, candidate) =
            match narrate(self.narrator.as_ref(), request, self.cfg.llm_timeout()).await {
                Ok(text) => match extract_object(&text) {
                    Some(obj) => (
                        lenient_text(obj.get("reflection")).unwrap_or_else(fallback_narrative),
                        lenient_text(obj.get("metaSummary").or_else(|| obj.get("meta_summary"))),
                        proposed_traits(obj.get("traits"), prev),
                    ),
                    None => {
                        tracing::warn!(stage = "consolidate", "no JSON object in output, keeping traits");
                        (text, None, prev)
                    }
                },
                Err(e) => {
                    tracing::warn!(stage = "consolidate", error = %e, "stage fell back, keeping traits");
                    (fallback_narrative(), None, prev)
                }
            };

        let clamped = clamp_toward(prev, candidate, self.cfg.reflect_clamp);
        let strict = StabilizerCfg::strict_from(&self.cfg);
        let (traits, report) = composite_with_history(prev, clamped, input.recent_deltas, &strict);

        let meta = self.meta_reflect(input.introspection.unwrap_or(&raw_reflection), &traits).await;
        let meta_fell_back = meta.is_fallback();
        let proposal = meta.into_value();
        let meta_summary = match proposed_summary {
            Some(s) if meta_fell_back => s,
            _ => proposal.summary,
        };

        let narrative = scrub(&self.tone.normalize(&raw_reflection));
        let summary = scrub(&meta_summary);
        let flagged = narrative.flagged() || summary.flagged();
        let safety = if flagged {
            "filtered"
        } else if report.action() != SafetyAction::Allow {
            report.action().as_str()
        } else {
            "ok"
        };

        tracing::debug!(
            safety,
            calm = traits.calm,
            empathy = traits.empathy,
            curiosity = traits.curiosity,
            next_focus = %proposal.next_focus,
            "consolidated"
        );

        ReflectionResult {
            reflection: narrative.text,
            introspection: input.introspection.map(str::to_string).unwrap_or(raw_reflection),
            meta_summary: summary.text,
            safety: safety.to_string(),
            flagged,
            traits,
            next_focus: proposal.next_focus,
            growth_adjustment: proposal.growth_adjustment,
            report: Some(report),
        }
    }

    /// Standalone reflection over a dialogue: load, consolidate, persist.
    /// Gives up with [`ReflectionResult::safe_default`] when the overall
    /// budget runs out.
    pub async fn full_reflect(
        &self,
        store: &dyn PersonaStore,
        identity: &str,
        dialogue: &[DialogueTurn],
    ) -> ReflectionResult {
        let work = async {
            let (persona, _) = load_or_neutral(store, identity, self.cfg.store_timeout()).await;
            let result = self
                .consolidate(ConsolidationInput {
                    traits: persona.traits,
                    growth: persona.growth,
                    prior_summary: &persona.meta_summary,
                    recent_deltas: &persona.recent_deltas,
                    dialogue,
                    introspection: None,
                })
                .await;
            (persona, result)
        };

        let budget = self.cfg.reflection_budget();
        let (persona, result) = match tokio::time::timeout(budget, work).await {
            Ok(done) => done,
            Err(_) => {
                tracing::warn!(identity, ?budget, "reflection budget exhausted");
                return ReflectionResult::safe_default();
            }
        };

        let now = chrono::Utc::now();
        let flags = result.report.as_ref().map(|r| r.flags()).unwrap_or_default();
        let safety_triggered =
            result.report.as_ref().is_some_and(|r| r.action() != SafetyAction::Allow);
        let update = PersonaUpdate {
            traits: result.traits,
            reflection: result.reflection.clone(),
            meta_summary: result.meta_summary.clone(),
            growth: blend_growth(persona.growth, result.growth_adjustment, self.cfg.growth_ema_weight),
            updated_at: now,
            entry: Some(GrowthEntry {
                traits_before: persona.traits,
                traits_after: result.traits,
                growth_adjustment: result.growth_adjustment,
                final_state: "reflect".to_string(),
                flags,
                safety_triggered,
                flagged: result.flagged,
                next_focus: result.next_focus.clone(),
                signals: TurnSignals::default(),
                recorded_at: now,
            }),
        };
        if let Err(e) = save_within(store, identity, &update, self.cfg.store_timeout()).await {
            tracing::warn!(identity, error = %e, "reflection not persisted");
        }
        result
    }

    fn context_prompt(&self, input: &ConsolidationInput<'_>) -> String {
        let window = self.cfg.recent_window.max(1);
        let skip = input.dialogue.len().saturating_sub(window);
        let mut out = String::from("Recent dialogue:\n");
        for turn in &input.dialogue[skip..] {
            let who = match turn.speaker {
                Speaker::User => "User",
                Speaker::Agent => "You",
            };
            out.push_str(&format!("{who}: {}\n", turn.content));
        }
        if let Some(intro) = input.introspection {
            out.push_str(&format!("\nIntrospection:\n{intro}\n"));
        }
        if !input.prior_summary.trim().is_empty() {
            out.push_str(&format!("\nPrevious self-summary: {}\n", input.prior_summary));
        }
        out.push_str(&format!(
            "\nGrowth level: {:.2}\nCurrent traits: calm={:.2}, empathy={:.2}, curiosity={:.2}",
            input.growth, input.traits.calm, input.traits.empathy, input.traits.curiosity
        ));
        out
    }
}

/// Exponential moving average of growth adjustments, kept in [0, 1].
pub fn blend_growth(prev: f32, adjustment: f32, weight: f32) -> f32 {
    let w = if weight.is_finite() { weight.clamp(0.0, 1.0) } else { 0.3 };
    let prev = if prev.is_finite() { prev } else { 0.0 };
    let adj = if adjustment.is_finite() { adjustment } else { prev };
    (prev * (1.0 - w) + adj * w).clamp(0.0, 1.0)
}

/// Traits object from model JSON; missing or unreadable axes keep `prev`.
fn proposed_traits(value: Option<&Value>, prev: TraitVector) -> TraitVector {
    let Some(Value::Object(obj)) = value else {
        return prev;
    };
    TraitVector::new(
        lenient_f32(obj.get("calm")).unwrap_or(prev.calm),
        lenient_f32(obj.get("empathy")).unwrap_or(prev.empathy),
        lenient_f32(obj.get("curiosity")).unwrap_or(prev.curiosity),
    )
}

/// Limit each axis of `candidate` to `prev ± limit`.
fn clamp_toward(prev: TraitVector, candidate: TraitVector, limit: f32) -> TraitVector {
    let limit = if limit.is_finite() { limit.abs() } else { 0.05 };
    let p = prev.axes();
    let c = candidate.axes();
    TraitVector::from_axes([0, 1, 2].map(|i| p[i] + (c[i] - p[i]).clamp(-limit, limit)))
}
