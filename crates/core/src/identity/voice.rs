use serde::{Deserialize, Serialize};

use super::traits::TraitVector;
use crate::config::PersonaCfg;

/// Register the reply is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyTone {
    Dry,
    Soft,
    #[default]
    Neutral,
}

impl ReplyTone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dry => "dry",
            Self::Soft => "soft",
            Self::Neutral => "neutral",
        }
    }

    /// Prompt wording for the register.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Dry => "Keep the tone dry and matter-of-fact.",
            Self::Soft => "Keep the tone soft and gentle.",
            Self::Neutral => "Keep the tone plain and even.",
        }
    }
}

impl std::fmt::Display for ReplyTone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation parameters for one reply, derived from the trait vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
    pub tone: ReplyTone,
}

impl Sampling {
    /// Curiosity warms the temperature up, calm cools it down.
    ///
    /// `temperature = base + (curiosity - 0.5) * 0.4 - (calm - 0.5) * 0.2`,
    /// clamped to the configured range. Tone is dry for a calm, low-empathy
    /// persona and soft for a high-empathy one.
    pub fn from_traits(traits: &TraitVector, cfg: &PersonaCfg) -> Self {
        let t = traits.coerce();
        let (lo, hi) = temperature_range(cfg.min_temperature, cfg.max_temperature);
        let base = if cfg.base_temperature.is_finite() { cfg.base_temperature } else { (lo + hi) / 2.0 };
        let raw = base + (t.curiosity - 0.5) * 0.4 - (t.calm - 0.5) * 0.2;

        let tone = if t.calm > 0.6 && t.empathy < 0.4 {
            ReplyTone::Dry
        } else if t.empathy > 0.6 {
            ReplyTone::Soft
        } else {
            ReplyTone::Neutral
        };

        Self { temperature: raw.clamp(lo, hi), max_tokens: cfg.reply_max_tokens.max(1), tone }
    }
}

/// Ordered, finite bounds. Unusable values fall back to [0, 1].
fn temperature_range(min: f32, max: f32) -> (f32, f32) {
    let lo = if min.is_finite() { min.max(0.0) } else { 0.0 };
    let hi = if max.is_finite() { max.max(0.0) } else { 1.0 };
    if lo <= hi { (lo, hi) } else { (hi, lo) }
}
