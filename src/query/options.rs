//! Per-query options, read leniently from a JSON object.
//!
//! Absent or wrong-typed entries fall back to the engine defaults; options
//! never make a query fail.

use serde_json::Value as JsonValue;

use crate::config::EngineConfig;

/// Read-only view over a query's options object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    raw: JsonValue,
}

impl QueryOptions {
    /// Wraps `raw`. Anything other than an object behaves as empty options.
    pub fn new(raw: JsonValue) -> Self {
        Self { raw }
    }

    /// The options as supplied.
    pub fn raw(&self) -> &JsonValue {
        &self.raw
    }

    fn get(&self, name: &str) -> Option<&JsonValue> {
        self.raw.as_object()?.get(name)
    }

    /// Boolean option, or `default` when absent or not a boolean.
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(JsonValue::as_bool).unwrap_or(default)
    }

    /// Numeric option, or `default` when absent or not a number.
    pub fn get_number(&self, name: &str, default: f64) -> f64 {
        self.get(name).and_then(JsonValue::as_f64).unwrap_or(default)
    }

    /// String entries of `optimizer.rules`; non-string entries are skipped.
    pub fn optimizer_rules(&self) -> Vec<String> {
        self.get("optimizer")
            .and_then(|optimizer| optimizer.get("rules"))
            .and_then(JsonValue::as_array)
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `maxNumberOfPlans` when positive, else `config.max_plans`.
    pub fn max_plans(&self, config: &EngineConfig) -> usize {
        positive(self.get("maxNumberOfPlans")).unwrap_or(config.max_plans)
    }

    /// `batchSize` when positive, else `config.batch_size`.
    pub fn batch_size(&self, config: &EngineConfig) -> usize {
        positive(self.get("batchSize")).unwrap_or(config.batch_size)
    }

    /// Whether explain returns every candidate instead of the best one.
    pub fn all_plans(&self) -> bool {
        self.get_bool("allPlans", false)
    }

    /// Whether explained plans carry per-node estimates.
    pub fn verbose_plans(&self) -> bool {
        self.get_bool("verbosePlans", false)
    }

    /// Whether results carry a phase profile.
    pub fn profile(&self, config: &EngineConfig) -> bool {
        self.get_bool("profile", config.profile)
    }
}

fn positive(value: Option<&JsonValue>) -> Option<usize> {
    let number = value?.as_f64()?;
    (number >= 1.0 && number.is_finite()).then_some(number as usize)
}

impl From<JsonValue> for QueryOptions {
    fn from(raw: JsonValue) -> Self {
        Self::new(raw)
    }
}
