use super::state::CycleState;
use crate::config::PersonaCfg;
use crate::types::{EmotionState, TraitVector};

pub const DEESCALATION_MESSAGE: &str =
    "Let's slow down a little. I'm going to take a breath before we continue.";
pub const SAFETY_MESSAGE: &str =
    "I want to make sure you're okay. If you are in danger or thinking about hurting yourself, \
     please reach out to local emergency services or someone you trust right now.";

/// Parameters of a recovery state.
///
/// Each attempt nudges traits toward calm and releases tension. Recovery
/// exits once calm passes `exit_calm` or after `max_attempts`, whichever
/// comes first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecoveryProfile {
    pub calm_step: f32,
    pub curiosity_step: f32,
    pub tension_release: f32,
    pub exit_calm: f32,
    pub max_attempts: u32,
    pub exit_to: CycleState,
    pub message: &'static str,
}

impl RecoveryProfile {
    pub fn overload(cfg: &PersonaCfg) -> Self {
        Self {
            calm_step: 0.06,
            curiosity_step: -0.03,
            tension_release: 0.5,
            exit_calm: cfg.overload_recovery_calm,
            max_attempts: cfg.recovery_max_attempts.max(1),
            exit_to: CycleState::Dialogue,
            message: DEESCALATION_MESSAGE,
        }
    }

    pub fn safety(cfg: &PersonaCfg) -> Self {
        Self {
            calm_step: 0.05,
            curiosity_step: 0.0,
            tension_release: 1.0,
            exit_calm: cfg.safety_recovery_calm,
            max_attempts: cfg.recovery_max_attempts.max(1),
            exit_to: CycleState::Idle,
            message: SAFETY_MESSAGE,
        }
    }

    /// Apply one attempt. `attempts` counts attempts already made this cycle
    /// and is incremented. Returns true once recovery should exit.
    pub fn attempt(&self, traits: &mut TraitVector, emotion: &mut EmotionState, attempts: &mut u32) -> bool {
        *attempts += 1;
        *traits = TraitVector::new(
            traits.calm + self.calm_step,
            traits.empathy,
            traits.curiosity + self.curiosity_step,
        );
        emotion.release_tension(self.tension_release);
        self.done(traits, *attempts)
    }

    pub fn done(&self, traits: &TraitVector, attempts: u32) -> bool {
        traits.calm > self.exit_calm || attempts >= self.max_attempts
    }
}
