use persona_llm::provider::LlmProvider;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::context::{CycleContext, CycleDisposition, CycleInput, CycleOutcome};
use super::guard::{Unmetered, UsageGuard};
use super::recovery::RecoveryProfile;
use super::state::{ConfigError, CycleState, TransitionTable};
use crate::cognition::{contradiction, response, summarizer};
use crate::config::PersonaCfg;
use crate::identity::voice::Sampling;
use crate::memory::{PersonaStore, StoreError, load_or_neutral, save_within};
use crate::reflection::{ConsolidationInput, NarrativeTone, ReflectionPipeline, blend_growth};
use crate::safety::{StabilizerCfg, check_overload, stabilize};
use crate::types::{
    APOLOGY_NARRATIVE, DepthHint, DialogueTurn, GrowthEntry, PersonaUpdate, ReferentTarget,
    ReflectionResult, SafetyAction, SafetyReport, TraitVector,
};

/// Drives one cognitive cycle per inbound utterance.
///
/// Holds no per-identity state: everything a cycle touches is loaded at entry
/// into a [`CycleContext`] and written back once at exit.
pub struct Orchestrator {
    replier: Arc<dyn LlmProvider>,
    narrator: Arc<dyn LlmProvider>,
    pipeline: ReflectionPipeline,
    store: Arc<dyn PersonaStore>,
    guard: Arc<dyn UsageGuard>,
    cfg: Arc<PersonaCfg>,
    table: TransitionTable,
}

impl Orchestrator {
    pub fn new(
        replier: Arc<dyn LlmProvider>,
        narrator: Arc<dyn LlmProvider>,
        store: Arc<dyn PersonaStore>,
        cfg: Arc<PersonaCfg>,
    ) -> Result<Self, ConfigError> {
        if cfg.max_cycle_steps == 0 {
            return Err(ConfigError::NoSteps);
        }
        let table = TransitionTable::standard();
        table.validate()?;
        Ok(Self {
            pipeline: ReflectionPipeline::new(narrator.clone(), cfg.clone()),
            replier,
            narrator,
            store,
            guard: Arc::new(Unmetered),
            cfg,
            table,
        })
    }

    pub fn with_guard(mut self, guard: Arc<dyn UsageGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_tone(mut self, tone: Arc<dyn NarrativeTone>) -> Self {
        self.pipeline = self.pipeline.with_tone(tone);
        self
    }

    pub fn with_table(mut self, table: TransitionTable) -> Result<Self, ConfigError> {
        table.validate()?;
        self.table = table;
        Ok(self)
    }

    pub fn cfg(&self) -> &PersonaCfg {
        &self.cfg
    }

    /// Run a full cycle for one utterance: gate, load, run, save.
    ///
    /// Never fails. A cancelled caller gets [`CycleDisposition::CallerGone`]
    /// but the cycle's state is persisted regardless.
    pub async fn handle(&self, input: CycleInput, cancel: &CancellationToken) -> CycleDisposition {
        let cycle_id = Uuid::new_v4();
        let span = tracing::info_span!("cycle", %cycle_id, identity = %input.identity);
        async move {
            if !self.guard.allows(&input.identity).await {
                tracing::info!("cycle denied by usage guard");
                return CycleDisposition::Denied { identity: input.identity };
            }

            let rate = self.guard.recent_rate(&input.identity).await;
            let (persona, _) =
                load_or_neutral(self.store.as_ref(), &input.identity, self.cfg.store_timeout()).await;
            let mut ctx = CycleContext::new(cycle_id, input, persona).with_message_rate(rate);
            self.run_cycle(&mut ctx).await;
            let outcome = self.finish(ctx).await;

            tracing::info!(
                final_state = %outcome.final_state,
                steps = outcome.steps(),
                stability = outcome.traits.stability_index(),
                persisted = outcome.persisted,
                "cycle complete"
            );
            if cancel.is_cancelled() {
                tracing::info!("caller went away, result dropped");
                return CycleDisposition::CallerGone { cycle_id };
            }
            CycleDisposition::Completed(Box::new(outcome))
        }
        .instrument(span)
        .await
    }

    /// Put an identity's traits back to neutral.
    pub async fn reset(&self, identity: &str) -> Result<(), StoreError> {
        let limit = self.cfg.store_timeout();
        match tokio::time::timeout(limit, self.store.reset(identity)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(limit)),
        }
    }

    /// Standalone reflection over a dialogue, outside any cycle.
    pub async fn reflect_now(&self, identity: &str, dialogue: &[DialogueTurn]) -> ReflectionResult {
        self.pipeline.full_reflect(self.store.as_ref(), identity, dialogue).await
    }

    /// Step the state machine until it stops, reaches idle, or hits the step
    /// ceiling. Illegal transitions end the cycle in the current state.
    ///
    /// At the ceiling the cycle ends in the last state that ran, or in idle
    /// when that state may hand back to idle. A state that was chosen but
    /// never ran is never reported as final.
    pub async fn run_cycle(&self, ctx: &mut CycleContext) {
        ctx.entry_report = self.entry_check(ctx);
        let mut state = if ctx.entry_report.recovery().is_some() {
            tracing::info!(note = ctx.entry_report.note(), "starting in overload prevention");
            CycleState::OverloadPrevent
        } else {
            CycleState::Idle
        };

        let max_steps = self.cfg.max_cycle_steps.max(1);
        let mut ran = state;
        while ctx.steps() < max_steps {
            ran = state;
            ctx.emotion.decay(state.decay());
            ctx.trace.push(state);
            tracing::debug!(state = %state, step = ctx.steps(), "state step");

            let next = match state {
                CycleState::Idle => self.on_idle(ctx),
                CycleState::Dialogue => self.on_dialogue(ctx).await,
                CycleState::Reflect => self.on_reflect(ctx).await,
                CycleState::Introspect => self.on_introspect(ctx).await,
                CycleState::OverloadPrevent => self.on_overload(ctx),
                CycleState::SafetyMode => self.on_safety(ctx),
            };

            let Some(next) = next else {
                break;
            };
            if !self.table.allows(state, next) {
                tracing::warn!(from = %state, to = %next, "illegal transition, ending cycle");
                break;
            }
            state = next;
            if state == CycleState::Idle {
                break;
            }
        }

        if state != ran && state != CycleState::Idle {
            tracing::warn!(last = %ran, pending = %state, max_steps, "step ceiling reached");
            state = if self.table.allows(ran, CycleState::Idle) { CycleState::Idle } else { ran };
        }
        ctx.final_state = state;
    }

    /// Trait overload first, then message rate. Either one sends the cycle
    /// into overload prevention.
    fn entry_check(&self, ctx: &CycleContext) -> SafetyReport {
        let report = check_overload(&ctx.traits, &StabilizerCfg::lenient_from(&self.cfg));
        let limit = self.cfg.overload_limit_per_min;
        if report.is_overload() || ctx.message_rate <= limit {
            return report;
        }
        SafetyReport::busy(format!(
            "{} messages in the last minute (limit {limit}); slowing down",
            ctx.message_rate
        ))
    }

    fn on_idle(&self, ctx: &mut CycleContext) -> Option<CycleState> {
        ctx.clear_hints();
        if ctx.input.utterance.trim().is_empty() {
            return None;
        }
        Some(CycleState::Dialogue)
    }

    async fn on_dialogue(&self, ctx: &mut CycleContext) -> Option<CycleState> {
        if ctx.input.risk_flagged {
            ctx.emotion.on_risk();
            return Some(CycleState::SafetyMode);
        }

        let sampling = Sampling::from_traits(&ctx.traits, &self.cfg);
        ctx.contradiction = contradiction::previous_user_turn(&ctx.input.history)
            .and_then(|previous| contradiction::detect(previous, &ctx.input.utterance));
        if let Some(note) = &ctx.contradiction {
            tracing::debug!(note = %note, "user reversed an earlier stance");
        }

        let summary = ctx.summary.as_deref().unwrap_or("");
        let system = response::build_system_prompt(
            &self.cfg.agent_name,
            &ctx.traits,
            &ctx.emotion,
            sampling.tone,
            summary,
            ctx.contradiction.as_deref(),
        );
        let recent = self.recent_history(&ctx.input.history);
        let messages = response::build_messages(system, recent, &ctx.input.utterance);
        let reply = response::generate(self.replier.as_ref(), messages, &sampling, self.cfg.llm_timeout()).await;

        ctx.tone = Some(sampling.tone);
        ctx.reply_fell_back = reply.is_fallback();
        ctx.reply = Some(reply.into_value());
        ctx.emotion.on_reply(ctx.traits.empathy);
        Some(CycleState::Reflect)
    }

    async fn on_reflect(&self, ctx: &mut CycleContext) -> Option<CycleState> {
        let reply = ctx.reply.as_deref().unwrap_or("");
        let growth_avg = (ctx.persona.growth > 0.0).then_some(ctx.persona.growth);
        let r = self.pipeline.reflect(&ctx.input.utterance, reply, growth_avg).await;

        ctx.emotion.on_reflect();
        ctx.reflect_narrative = Some(r.narrative.into_value());
        ctx.depth_hint = Some(r.depth_hint);
        ctx.self_referent = Some(r.referent);
        Some(CycleState::Introspect)
    }

    async fn on_introspect(&self, ctx: &mut CycleContext) -> Option<CycleState> {
        let narrative = ctx.reflect_narrative.as_deref().unwrap_or(APOLOGY_NARRATIVE);
        let hint = ctx.depth_hint.unwrap_or(DepthHint::Neutral);
        let introspection = self
            .pipeline
            .introspect(narrative, hint, &ctx.traits, ctx.summary.as_deref())
            .await
            .into_value();

        let mut dialogue = ctx.input.history.clone();
        dialogue.push(DialogueTurn::user(ctx.input.utterance.clone()));
        if let Some(reply) = &ctx.reply {
            dialogue.push(DialogueTurn::agent(reply.clone()));
        }
        let input = ConsolidationInput {
            traits: ctx.traits,
            growth: ctx.persona.growth,
            prior_summary: &ctx.persona.meta_summary,
            recent_deltas: &ctx.persona.recent_deltas,
            dialogue: &dialogue,
            introspection: Some(introspection.as_str()),
        };

        let (result, summary) = tokio::join!(
            self.pipeline.consolidate(input),
            self.summarize(&ctx.input.history, ctx.summary.as_deref()),
        );

        let self_reference = ctx.self_referent.as_ref().is_some_and(|r| r.target == ReferentTarget::Agent);
        let mut result = result;
        result.report = result.report.map(|r| r.with_self_reference(self_reference));
        ctx.traits = result.traits;
        ctx.reflection = Some(result);
        if summary.is_some() {
            ctx.summary = summary;
        }
        Some(CycleState::Idle)
    }

    fn on_overload(&self, ctx: &mut CycleContext) -> Option<CycleState> {
        let profile = RecoveryProfile::overload(&self.cfg);
        ctx.safety_triggered = true;
        ctx.notice = Some(profile.message.to_string());
        let done = profile.attempt(&mut ctx.traits, &mut ctx.emotion, &mut ctx.overload_attempts);
        ctx.calm_trace.push(ctx.traits.calm);
        tracing::debug!(attempt = ctx.overload_attempts, calm = ctx.traits.calm, done, "overload recovery");
        if done { Some(profile.exit_to) } else { Some(CycleState::OverloadPrevent) }
    }

    /// The only exit is idle, so every attempt happens within one step.
    fn on_safety(&self, ctx: &mut CycleContext) -> Option<CycleState> {
        let profile = RecoveryProfile::safety(&self.cfg);
        ctx.safety_triggered = true;
        ctx.notice = Some(profile.message.to_string());
        loop {
            let done = profile.attempt(&mut ctx.traits, &mut ctx.emotion, &mut ctx.safety_attempts);
            ctx.calm_trace.push(ctx.traits.calm);
            if done {
                break;
            }
        }
        tracing::debug!(attempts = ctx.safety_attempts, calm = ctx.traits.calm, "safety mode settled");
        Some(profile.exit_to)
    }

    /// Condense older turns once the history grows past the trigger.
    /// `None` when no summarization was needed.
    async fn summarize(&self, history: &[DialogueTurn], prior: Option<&str>) -> Option<String> {
        let (older, _) = summarizer::split_history(history, self.cfg.summary_trigger_turns, self.cfg.recent_window)?;
        let summary =
            summarizer::summarize(self.narrator.as_ref(), older, prior.unwrap_or(""), self.cfg.llm_timeout()).await;
        Some(summary.into_value()).filter(|s| !s.trim().is_empty())
    }

    fn recent_history<'a>(&self, history: &'a [DialogueTurn]) -> &'a [DialogueTurn] {
        summarizer::split_history(history, self.cfg.summary_trigger_turns, self.cfg.recent_window)
            .map(|(_, recent)| recent)
            .unwrap_or(history)
    }

    /// Close the cycle: final safety net, one save, caller-facing outcome.
    async fn finish(&self, ctx: CycleContext) -> CycleOutcome {
        let lenient = StabilizerCfg::lenient_from(&self.cfg);
        let mut traits = ctx.traits.coerce();
        if check_overload(&traits, &lenient).is_overload() {
            traits = stabilize(traits);
        }

        let report = ctx
            .reflection
            .as_ref()
            .and_then(|r| r.report.clone())
            .unwrap_or_else(|| ctx.entry_report.clone());
        let did_work = ctx.steps() > 1 || ctx.final_state != CycleState::Idle;

        let persisted = if did_work {
            let update = self.persona_update(&ctx, traits, &report);
            match save_within(self.store.as_ref(), &ctx.input.identity, &update, self.cfg.store_timeout()).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "cycle state not persisted");
                    false
                }
            }
        } else {
            false
        };

        let reply = ctx.reply.clone().or_else(|| ctx.notice.clone()).unwrap_or_default();
        let recent = self.recent_history(&ctx.input.history).to_vec();
        CycleOutcome {
            cycle_id: ctx.cycle_id,
            identity: ctx.input.identity,
            reply,
            reply_fell_back: ctx.reply_fell_back,
            tone: ctx.tone,
            contradiction: ctx.contradiction,
            final_state: ctx.final_state,
            trace: ctx.trace,
            traits_before: ctx.persona.traits,
            traits,
            emotion: ctx.emotion,
            report,
            reflection: ctx.reflection,
            summary: ctx.summary.unwrap_or_default(),
            recent,
            self_referent: ctx.self_referent,
            persisted,
        }
    }

    fn persona_update(
        &self,
        ctx: &CycleContext,
        traits: TraitVector,
        report: &SafetyReport,
    ) -> PersonaUpdate {
        let now = chrono::Utc::now();
        let persona = &ctx.persona;
        let reflection = ctx.reflection.as_ref();
        PersonaUpdate {
            traits,
            reflection: reflection.map(|r| r.reflection.clone()).unwrap_or_else(|| persona.reflection.clone()),
            meta_summary: reflection
                .map(|r| r.meta_summary.clone())
                .unwrap_or_else(|| persona.meta_summary.clone()),
            growth: reflection
                .map(|r| blend_growth(persona.growth, r.growth_adjustment, self.cfg.growth_ema_weight))
                .unwrap_or(persona.growth),
            updated_at: now,
            entry: Some(GrowthEntry {
                traits_before: persona.traits,
                traits_after: traits,
                growth_adjustment: reflection.map_or(0.0, |r| r.growth_adjustment),
                final_state: ctx.final_state.as_str().to_string(),
                flags: report.flags(),
                safety_triggered: ctx.safety_triggered || report.action() != SafetyAction::Allow,
                flagged: reflection.is_some_and(|r| r.flagged),
                next_focus: reflection
                    .map(|r| r.next_focus.clone())
                    .unwrap_or_else(|| crate::reflection::meta::DEFAULT_FOCUS.to_string()),
                signals: ctx.signals(),
                recorded_at: now,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EphemeralStore;
    use crate::types::CyclePersona;
    use persona_llm::provider::{FailingProvider, MockProvider};

    fn orchestrator(replier: Arc<dyn LlmProvider>, narrator: Arc<dyn LlmProvider>) -> Orchestrator {
        Orchestrator::new(replier, narrator, Arc::new(EphemeralStore::default()), Arc::new(PersonaCfg::default()))
            .unwrap()
    }

    fn ctx(utterance: &str, traits: TraitVector) -> CycleContext {
        CycleContext::new(
            Uuid::new_v4(),
            CycleInput::new("u1", utterance),
            CyclePersona { traits, ..CyclePersona::default() },
        )
    }

    #[tokio::test]
    async fn blank_utterance_stops_at_idle() {
        let o = orchestrator(Arc::new(MockProvider::new("hi")), Arc::new(FailingProvider));
        let mut c = ctx("   ", TraitVector::neutral());
        o.run_cycle(&mut c).await;
        assert_eq!(c.trace, vec![CycleState::Idle]);
        assert_eq!(c.final_state, CycleState::Idle);
        assert!(c.reply.is_none());
    }

    #[tokio::test]
    async fn normal_cycle_visits_every_stage() {
        let o = orchestrator(Arc::new(MockProvider::new("Glad to hear it.")), Arc::new(FailingProvider));
        let mut c = ctx("I had a good day", TraitVector::neutral());
        o.run_cycle(&mut c).await;
        assert_eq!(
            c.trace,
            vec![CycleState::Idle, CycleState::Dialogue, CycleState::Reflect, CycleState::Introspect]
        );
        assert_eq!(c.final_state, CycleState::Idle);
        assert_eq!(c.reply.as_deref(), Some("Glad to hear it."));
        assert!(c.reflection.is_some());
    }

    #[tokio::test]
    async fn overloaded_traits_start_in_recovery() {
        let o = orchestrator(Arc::new(MockProvider::new("ok")), Arc::new(FailingProvider));
        let mut c = ctx("hello", TraitVector::new(0.1, 0.2, 0.1));
        o.run_cycle(&mut c).await;
        assert_eq!(c.trace[0], CycleState::OverloadPrevent);
        assert!(c.entry_report.is_overload());
        assert!(c.steps() <= o.cfg().max_cycle_steps);
        assert!(c.calm_trace.windows(2).all(|w| w[1] >= w[0]));
        assert!(c.trace.contains(&c.final_state), "{:?} ended in {}", c.trace, c.final_state);
    }

    #[tokio::test]
    async fn ceiling_ends_in_last_state_that_ran() {
        use CycleState::*;
        let cfg = PersonaCfg { max_cycle_steps: 3, ..PersonaCfg::default() };
        let o = Orchestrator::new(
            Arc::new(MockProvider::new("ok")),
            Arc::new(FailingProvider),
            Arc::new(EphemeralStore::default()),
            Arc::new(cfg),
        )
        .unwrap();
        let mut c = ctx("hello", TraitVector::neutral());
        o.run_cycle(&mut c).await;
        assert_eq!(c.trace, vec![Idle, Dialogue, Reflect]);
        assert_eq!(c.final_state, Reflect);
        assert!(c.reflection.is_none());
    }

    #[tokio::test]
    async fn ceiling_settles_to_idle_when_allowed() {
        use CycleState::*;
        // the standard table plus Reflect -> Idle
        let edges = [
            (Idle, Dialogue),
            (Dialogue, Reflect),
            (Dialogue, SafetyMode),
            (Reflect, Introspect),
            (Reflect, Idle),
            (Introspect, Idle),
            (OverloadPrevent, Dialogue),
            (OverloadPrevent, OverloadPrevent),
            (SafetyMode, Idle),
        ];
        let cfg = PersonaCfg { max_cycle_steps: 3, ..PersonaCfg::default() };
        let o = Orchestrator::new(
            Arc::new(MockProvider::new("ok")),
            Arc::new(FailingProvider),
            Arc::new(EphemeralStore::default()),
            Arc::new(cfg),
        )
        .unwrap()
        .with_table(TransitionTable::from_edges(&edges))
        .unwrap();
        let mut c = ctx("hello", TraitVector::neutral());
        o.run_cycle(&mut c).await;
        assert_eq!(c.trace, vec![Idle, Dialogue, Reflect]);
        assert_eq!(c.final_state, Idle);
    }

    #[tokio::test]
    async fn message_burst_starts_in_recovery() {
        let o = orchestrator(Arc::new(MockProvider::new("ok")), Arc::new(FailingProvider));
        let limit = o.cfg().overload_limit_per_min;
        for (rate, recovers) in [(0, false), (limit, false), (limit + 1, true), (limit * 3, true)] {
            let mut c = ctx("hello", TraitVector::neutral()).with_message_rate(rate);
            o.run_cycle(&mut c).await;
            assert_eq!(c.trace[0] == CycleState::OverloadPrevent, recovers, "rate {rate}");
            assert_eq!(c.safety_triggered, recovers, "rate {rate}");
            assert!(!c.entry_report.is_overload(), "rate {rate}");
            assert_eq!(c.final_state, CycleState::Idle, "rate {rate}");
            assert!(c.reply.is_some(), "rate {rate}");
        }
    }

    #[tokio::test]
    async fn illegal_transition_fails_closed() {
        use CycleState::*;
        // a table without Dialogue -> Reflect: the cycle must stop in Dialogue
        let table = TransitionTable::from_edges(&[
            (Idle, Dialogue),
            (Dialogue, SafetyMode),
            (Reflect, Introspect),
            (Introspect, Idle),
            (OverloadPrevent, Dialogue),
            (SafetyMode, Idle),
        ]);
        let o = orchestrator(Arc::new(MockProvider::new("ok")), Arc::new(FailingProvider))
            .with_table(table)
            .unwrap();
        let mut c = ctx("hello", TraitVector::neutral());
        o.run_cycle(&mut c).await;
        assert_eq!(c.trace, vec![Idle, Dialogue]);
        assert_eq!(c.final_state, Dialogue);
    }

    #[test]
    fn zero_steps_rejected() {
        let cfg = PersonaCfg { max_cycle_steps: 0, ..PersonaCfg::default() };
        let r = Orchestrator::new(
            Arc::new(FailingProvider),
            Arc::new(FailingProvider),
            Arc::new(EphemeralStore::default()),
            Arc::new(cfg),
        );
        assert!(matches!(r, Err(ConfigError::NoSteps)));
    }
}
