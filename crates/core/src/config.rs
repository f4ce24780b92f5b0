use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;

/// All persona-cycle parameters. Loaded from the `persona_config` table at startup.
/// First boot writes defaults; subsequent boots read existing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaCfg {
    // identity
    pub agent_name: String,

    // orchestrator
    pub max_cycle_steps: usize,
    pub overload_limit_per_min: u32,

    // reply sampling
    pub base_temperature: f32,
    pub min_temperature: f32,
    pub max_temperature: f32,
    pub reply_max_tokens: u32,

    // stabilizer profiles
    pub lenient_max_delta: f32,
    pub lenient_alpha: f32,
    pub strict_max_delta: f32,
    pub strict_alpha: f32,
    pub overload_high_sum: f32,
    pub overload_low_sum: f32,
    pub oscillation_window: usize,

    // reflection
    pub reflect_clamp: f32,
    pub recent_window: usize,
    pub summary_trigger_turns: usize,
    pub growth_ema_weight: f32,

    // recovery
    pub overload_recovery_calm: f32,
    pub safety_recovery_calm: f32,
    pub recovery_max_attempts: u32,

    // external call budgets
    pub llm_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub reflection_budget_secs: u64,
}

impl Default for PersonaCfg {
    fn default() -> Self {
        Self {
            agent_name: "Iris".to_string(),
            max_cycle_steps: 6,
            overload_limit_per_min: 20,
            base_temperature: 0.6,
            min_temperature: 0.3,
            max_temperature: 0.9,
            reply_max_tokens: 512,
            lenient_max_delta: 0.2,
            lenient_alpha: 0.4,
            strict_max_delta: 0.05,
            strict_alpha: 0.35,
            overload_high_sum: 2.6,
            overload_low_sum: 0.8,
            oscillation_window: 4,
            reflect_clamp: 0.05,
            recent_window: 8,
            summary_trigger_turns: 12,
            growth_ema_weight: 0.3,
            overload_recovery_calm: 0.48,
            safety_recovery_calm: 0.52,
            recovery_max_attempts: 4,
            llm_timeout_secs: 20,
            store_timeout_secs: 5,
            reflection_budget_secs: 60,
        }
    }
}

impl PersonaCfg {
    /// Load config from `persona_config` table. If table is empty, seed with defaults.
    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM persona_config")
            .fetch_all(pool)
            .await?;

        if rows.is_empty() {
            let cfg = Self::default();
            cfg.seed(pool).await?;
            return Ok(cfg);
        }

        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Write all default values into `persona_config` table.
    async fn seed(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        for (key, value, desc) in &self.to_entries() {
            sqlx::query(
                "INSERT INTO persona_config (key, value, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(desc)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        Self {
            agent_name: m
                .get("agent_name")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(d.agent_name),
            max_cycle_steps: get_or(m, "max_cycle_steps", d.max_cycle_steps),
            overload_limit_per_min: get_or(m, "overload_limit_per_min", d.overload_limit_per_min),
            base_temperature: get_or(m, "base_temperature", d.base_temperature),
            min_temperature: get_or(m, "min_temperature", d.min_temperature),
            max_temperature: get_or(m, "max_temperature", d.max_temperature),
            reply_max_tokens: get_or(m, "reply_max_tokens", d.reply_max_tokens),
            lenient_max_delta: get_or(m, "lenient_max_delta", d.lenient_max_delta),
            lenient_alpha: get_or(m, "lenient_alpha", d.lenient_alpha),
            strict_max_delta: get_or(m, "strict_max_delta", d.strict_max_delta),
            strict_alpha: get_or(m, "strict_alpha", d.strict_alpha),
            overload_high_sum: get_or(m, "overload_high_sum", d.overload_high_sum),
            overload_low_sum: get_or(m, "overload_low_sum", d.overload_low_sum),
            oscillation_window: get_or(m, "oscillation_window", d.oscillation_window),
            reflect_clamp: get_or(m, "reflect_clamp", d.reflect_clamp),
            recent_window: get_or(m, "recent_window", d.recent_window),
            summary_trigger_turns: get_or(m, "summary_trigger_turns", d.summary_trigger_turns),
            growth_ema_weight: get_or(m, "growth_ema_weight", d.growth_ema_weight),
            overload_recovery_calm: get_or(m, "overload_recovery_calm", d.overload_recovery_calm),
            safety_recovery_calm: get_or(m, "safety_recovery_calm", d.safety_recovery_calm),
            recovery_max_attempts: get_or(m, "recovery_max_attempts", d.recovery_max_attempts),
            llm_timeout_secs: get_or(m, "llm_timeout_secs", d.llm_timeout_secs),
            store_timeout_secs: get_or(m, "store_timeout_secs", d.store_timeout_secs),
            reflection_budget_secs: get_or(m, "reflection_budget_secs", d.reflection_budget_secs),
        }
    }

    fn to_entries(&self) -> Vec<(&str, String, &str)> {
        vec![
            ("agent_name", self.agent_name.clone(), "Agent proper name for self-reference"),
            ("max_cycle_steps", self.max_cycle_steps.to_string(), "Max state handler invocations per cycle"),
            ("overload_limit_per_min", self.overload_limit_per_min.to_string(), "Messages per minute above which a cycle starts in overload prevention"),
            ("base_temperature", self.base_temperature.to_string(), "Reply temperature for a neutral persona"),
            ("min_temperature", self.min_temperature.to_string(), "Lowest reply temperature"),
            ("max_temperature", self.max_temperature.to_string(), "Highest reply temperature"),
            ("reply_max_tokens", self.reply_max_tokens.to_string(), "Token limit for a reply"),
            ("lenient_max_delta", self.lenient_max_delta.to_string(), "Per-axis delta cap, lenient profile"),
            ("lenient_alpha", self.lenient_alpha.to_string(), "EMA weight, lenient profile"),
            ("strict_max_delta", self.strict_max_delta.to_string(), "Per-axis delta cap during reflection"),
            ("strict_alpha", self.strict_alpha.to_string(), "EMA weight during reflection"),
            ("overload_high_sum", self.overload_high_sum.to_string(), "Trait sum above which activity is excessive"),
            ("overload_low_sum", self.overload_low_sum.to_string(), "Trait sum below which activity is depleted"),
            ("oscillation_window", self.oscillation_window.to_string(), "Recent deltas inspected for oscillation"),
            ("reflect_clamp", self.reflect_clamp.to_string(), "Max per-axis move of a reflection proposal"),
            ("recent_window", self.recent_window.to_string(), "Dialogue turns shown to reflection"),
            ("summary_trigger_turns", self.summary_trigger_turns.to_string(), "History length that triggers summarization"),
            ("growth_ema_weight", self.growth_ema_weight.to_string(), "Weight of the newest growth adjustment"),
            ("overload_recovery_calm", self.overload_recovery_calm.to_string(), "Calm level that ends overload recovery"),
            ("safety_recovery_calm", self.safety_recovery_calm.to_string(), "Calm level that ends safety mode"),
            ("recovery_max_attempts", self.recovery_max_attempts.to_string(), "Recovery attempts before forced exit"),
            ("llm_timeout_secs", self.llm_timeout_secs.to_string(), "Timeout per LLM call"),
            ("store_timeout_secs", self.store_timeout_secs.to_string(), "Timeout per persistence call"),
            ("reflection_budget_secs", self.reflection_budget_secs.to_string(), "Overall budget for a standalone reflection"),
        ]
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn reflection_budget(&self) -> Duration {
        Duration::from_secs(self.reflection_budget_secs)
    }
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_map_overrides_and_falls_back() {
        let mut m = HashMap::new();
        m.insert("agent_name".to_string(), "Nova".to_string());
        m.insert("strict_max_delta".to_string(), "0.03".to_string());
        m.insert("max_cycle_steps".to_string(), "not-a-number".to_string());
        let cfg = PersonaCfg::from_map(&m);
        assert_eq!(cfg.agent_name, "Nova");
        assert!((cfg.strict_max_delta - 0.03).abs() < f32::EPSILON);
        assert_eq!(cfg.max_cycle_steps, 6);
    }

    #[test]
    fn blank_agent_name_keeps_default() {
        let mut m = HashMap::new();
        m.insert("agent_name".to_string(), "   ".to_string());
        assert_eq!(PersonaCfg::from_map(&m).agent_name, "Iris");
    }

    #[test]
    fn entries_cover_every_field() {
        let cfg = PersonaCfg::default();
        let entries = cfg.to_entries();
        let map: HashMap<String, String> =
            entries.iter().map(|(k, v, _)| (k.to_string(), v.clone())).collect();
        let back = PersonaCfg::from_map(&map);
        assert_eq!(entries.len(), 24);
        assert_eq!(back.recovery_max_attempts, cfg.recovery_max_attempts);
        assert!((back.overload_high_sum - cfg.overload_high_sum).abs() < f32::EPSILON);
    }
}
