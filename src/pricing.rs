//! Cost estimation for model usage.

use serde_json::Value;

use crate::models::Usage;

/// Per-million-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

impl ModelPrice {
    pub const fn new(input: f64, output: f64) -> Self {
        Self {
            input,
            output,
            cache_read: input * 0.1,
            cache_write: input * 1.25,
        }
    }
}

/// Built-in price table, matched by model id prefix (longest first).
const PRICES: &[(&str, ModelPrice)] = &[
    ("claude-opus-4", ModelPrice::new(15.0, 75.0)),
    ("claude-sonnet-4", ModelPrice::new(3.0, 15.0)),
    ("claude-3-7-sonnet", ModelPrice::new(3.0, 15.0)),
    ("claude-3-5-sonnet", ModelPrice::new(3.0, 15.0)),
    ("claude-haiku-4", ModelPrice::new(1.0, 5.0)),
    ("claude-3-5-haiku", ModelPrice::new(0.8, 4.0)),
    ("gemini-2.5-pro", ModelPrice::new(1.25, 10.0)),
    ("gemini-2.5-flash", ModelPrice::new(0.3, 2.5)),
    ("gpt-4.1-mini", ModelPrice::new(0.4, 1.6)),
    ("gpt-4.1", ModelPrice::new(2.0, 8.0)),
];

/// Prices a model step.
pub trait PricingProvider: Send + Sync {
    /// Cost in USD. `metadata` carries provider-specific usage details.
    fn cost(&self, provider: &str, model: &str, usage: &Usage, metadata: Option<&Value>) -> f64;
}

/// Looks models up in the built-in table; unknown models cost nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TablePricing;

impl TablePricing {
    pub fn price_for(model: &str) -> Option<ModelPrice> {
        let bare = model.rsplit('/').next().unwrap_or(model);
        PRICES
            .iter()
            .filter(|(prefix, _)| bare.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, price)| *price)
    }
}

impl PricingProvider for TablePricing {
    fn cost(&self, _provider: &str, model: &str, usage: &Usage, _metadata: Option<&Value>) -> f64 {
        let Some(price) = Self::price_for(model) else {
            return 0.0;
        };
        let per_token = |tokens: u32, per_million: f64| f64::from(tokens) * per_million / 1_000_000.0;
        per_token(usage.input_tokens, price.input)
            + per_token(usage.output_tokens, price.output)
            + per_token(usage.cache_read_input_tokens, price.cache_read)
            + per_token(usage.cache_creation_input_tokens, price.cache_write)
    }
}

/// Format a USD cost for display.
#[must_use]
pub fn format_cost(usd: f64) -> String {
    format!("${usd:.4}")
}
