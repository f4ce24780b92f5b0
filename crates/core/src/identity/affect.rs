use serde::{Deserialize, Serialize};

/// Warmth gained per reply, scaled by the empathy axis.
const REPLY_WARMTH_GAIN: f32 = 0.12;
/// Hesitation added when the agent turns inward.
const REFLECT_HESITATION_GAIN: f32 = 0.05;
/// Tension spike on a risk-flagged utterance.
const RISK_TENSION_SPIKE: f32 = 0.25;

/// Per-dimension multiplicative decay applied on a state transition.
/// Every factor is strictly below 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayFactors {
    pub tension: f32,
    pub warmth: f32,
    pub hesitation: f32,
}

/// Settling back toward rest.
pub const REST_DECAY: DecayFactors = DecayFactors { tension: 0.80, warmth: 0.90, hesitation: 0.80 };
/// Engaged in conversation.
pub const DIALOGUE_DECAY: DecayFactors = DecayFactors { tension: 0.90, warmth: 0.95, hesitation: 0.85 };
/// Reflecting or introspecting.
pub const REFLECT_DECAY: DecayFactors = DecayFactors { tension: 0.85, warmth: 0.95, hesitation: 0.95 };
/// Recovering from overload or a safety trigger.
pub const RECOVERY_DECAY: DecayFactors = DecayFactors { tension: 0.50, warmth: 0.90, hesitation: 0.70 };

/// Intra-cycle mood. Lives for one cycle and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionState {
    pub tension: f32,
    pub warmth: f32,
    pub hesitation: f32,
}

impl Default for EmotionState {
    fn default() -> Self {
        Self { tension: 0.10, warmth: 0.20, hesitation: 0.10 }
    }
}

impl EmotionState {
    /// Clamp all dimensions to [0.0, 1.0]; non-finite values reset to zero.
    pub fn clamp(&mut self) {
        for v in [&mut self.tension, &mut self.warmth, &mut self.hesitation] {
            *v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        }
    }

    pub fn decay(&mut self, f: DecayFactors) {
        self.tension *= f.tension;
        self.warmth *= f.warmth;
        self.hesitation *= f.hesitation;
        self.clamp();
    }

    /// Reply produced: warmth follows empathy, hesitation eases.
    pub fn on_reply(&mut self, empathy: f32) {
        self.warmth += REPLY_WARMTH_GAIN * empathy.clamp(0.0, 1.0);
        self.hesitation *= 0.9;
        self.clamp();
    }

    /// Turning inward raises hesitation slightly.
    pub fn on_reflect(&mut self) {
        self.hesitation += REFLECT_HESITATION_GAIN;
        self.clamp();
    }

    /// Upstream classifier flagged the utterance.
    pub fn on_risk(&mut self) {
        self.tension += RISK_TENSION_SPIKE;
        self.clamp();
    }

    /// Aggressive tension release used by recovery states.
    pub fn release_tension(&mut self, factor: f32) {
        self.tension *= factor.clamp(0.0, 1.0);
        self.clamp();
    }

    /// Single-line form for prompts and logs.
    pub fn describe(&self) -> String {
        format!(
            "tension={:.2}, warmth={:.2}, hesitation={:.2}",
            self.tension, self.warmth, self.hesitation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_factors_are_contractive() {
        for f in [REST_DECAY, DIALOGUE_DECAY, REFLECT_DECAY, RECOVERY_DECAY] {
            assert!(f.tension < 1.0 && f.warmth < 1.0 && f.hesitation < 1.0);
        }
    }

    #[test]
    fn repeated_decay_without_stimulus_fades() {
        let mut e = EmotionState { tension: 1.0, warmth: 1.0, hesitation: 1.0 };
        for _ in 0..40 {
            e.decay(DIALOGUE_DECAY);
        }
        assert!(e.tension < 0.05 && e.hesitation < 0.05);
        assert!(e.warmth < 0.2);
    }

    #[test]
    fn reply_warms_in_proportion_to_empathy() {
        let mut cold = EmotionState::default();
        let mut warm = EmotionState::default();
        cold.on_reply(0.1);
        warm.on_reply(0.9);
        assert!(warm.warmth > cold.warmth);
    }

    #[test]
    fn stimulus_stays_bounded() {
        let mut e = EmotionState::default();
        for _ in 0..20 {
            e.on_risk();
            e.on_reflect();
            e.on_reply(5.0);
        }
        assert!(e.tension <= 1.0 && e.warmth <= 1.0 && e.hesitation <= 1.0);
    }

    #[test]
    fn release_tension_halves() {
        let mut e = EmotionState { tension: 0.8, ..EmotionState::default() };
        e.release_tension(0.5);
        assert!((e.tension - 0.4).abs() < 1e-6);
    }

    #[test]
    fn describe_format() {
        let e = EmotionState { tension: 0.25, warmth: 0.5, hesitation: 0.1 };
        assert_eq!(e.describe(), "tension=0.25, warmth=0.50, hesitation=0.10");
    }
}
