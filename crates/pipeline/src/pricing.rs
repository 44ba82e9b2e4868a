//! Static per-provider price table used to turn token usage into cost.
//!
//! Prices are quoted in USD per million tokens, as providers publish them.
//! A model the table does not know is priced at its provider's most expensive
//! entry so that an unlisted model is never treated as free.

use serde::{Deserialize, Serialize};

use crate::{TokenCost, TokenUsage};

/// Price of one model, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPrice {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    /// Cost of `usage` at this price.
    pub fn cost_of(self, usage: TokenUsage) -> TokenCost {
        let input = usage.input.as_u64() as f64 / 1_000_000.0 * self.input_per_mtok;
        let output = usage.output.as_u64() as f64 / 1_000_000.0 * self.output_per_mtok;
        TokenCost::new(input + output).unwrap_or_default()
    }

    /// Combined price used to pick the most expensive entry of a provider.
    fn weight(self) -> f64 {
        self.input_per_mtok + self.output_per_mtok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PriceEntry {
    provider: String,
    model: String,
    price: ModelPrice,
}

/// Lookup table from `(provider, model)` to [`ModelPrice`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    entries: Vec<PriceEntry>,
    /// Used when the provider itself is unknown.
    fallback: ModelPrice,
}

impl PriceTable {
    /// An empty table that prices everything at `fallback`.
    pub fn new(fallback: ModelPrice) -> Self {
        Self {
            entries: Vec::new(),
            fallback,
        }
    }

    /// Adds or replaces the price of one model.
    #[must_use]
    pub fn with_model(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        price: ModelPrice,
    ) -> Self {
        let provider = provider.into();
        let model = model.into();
        self.entries
            .retain(|e| !(e.provider == provider && e.model == model));
        self.entries.push(PriceEntry {
            provider,
            model,
            price,
        });
        self
    }

    /// The published prices of the providers Forgeflow ships adapters for.
    pub fn standard() -> Self {
        Self::new(ModelPrice::new(15.0, 75.0))
            .with_model("anthropic", "claude-opus-4-1", ModelPrice::new(15.0, 75.0))
            .with_model("anthropic", "claude-sonnet-4-5", ModelPrice::new(3.0, 15.0))
            .with_model("anthropic", "claude-haiku-4-5", ModelPrice::new(1.0, 5.0))
            .with_model("openai", "gpt-4o", ModelPrice::new(2.5, 10.0))
            .with_model("openai", "gpt-4o-mini", ModelPrice::new(0.15, 0.6))
    }

    /// Price for `model` served by `provider`.
    ///
    /// Exact matches win; dated snapshots such as `claude-sonnet-4-5-20250929`
    /// match their undated entry. Unknown models of a known provider get that
    /// provider's most expensive price; unknown providers get the fallback.
    pub fn price_for(&self, provider: &str, model: &str) -> ModelPrice {
        let of_provider = || self.entries.iter().filter(|e| e.provider == provider);

        if let Some(entry) = of_provider().find(|e| e.model == model) {
            return entry.price;
        }
        if let Some(entry) = of_provider()
            .filter(|e| model.starts_with(e.model.as_str()))
            .max_by_key(|e| e.model.len())
        {
            return entry.price;
        }
        of_provider()
            .map(|e| e.price)
            .max_by(|a, b| a.weight().total_cmp(&b.weight()))
            .unwrap_or(self.fallback)
    }

    /// Cost of `usage` on `model` served by `provider`.
    pub fn cost(&self, provider: &str, model: &str, usage: TokenUsage) -> TokenCost {
        self.price_for(provider, model).cost_of(usage)
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_calculation() {
        let table = PriceTable::standard();
        let cost = table.cost(
            "anthropic",
            "claude-sonnet-4-5",
            TokenUsage::new(1_000_000, 500_000),
        );
        // input: 1M * 3.0/1M = 3.0; output: 500K * 15.0/1M = 7.5
        assert!((cost.as_f64() - 10.5).abs() < 1e-9, "got {cost}");
    }

    #[test]
    fn dated_snapshot_matches_undated_entry() {
        let table = PriceTable::standard();
        assert_eq!(
            table.price_for("anthropic", "claude-haiku-4-5-20251001"),
            ModelPrice::new(1.0, 5.0)
        );
    }

    #[test]
    fn unknown_model_uses_most_expensive_of_provider() {
        let table = PriceTable::standard();
        assert_eq!(
            table.price_for("openai", "gpt-9-preview"),
            ModelPrice::new(2.5, 10.0)
        );
    }

    #[test]
    fn unknown_provider_uses_fallback() {
        let table = PriceTable::new(ModelPrice::new(1.0, 2.0));
        assert_eq!(table.price_for("acme", "any"), ModelPrice::new(1.0, 2.0));
    }

    #[test]
    fn with_model_replaces_existing_entry() {
        let table = PriceTable::standard().with_model(
            "anthropic",
            "claude-sonnet-4-5",
            ModelPrice::new(0.0, 0.0),
        );
        assert!(table
            .cost("anthropic", "claude-sonnet-4-5", TokenUsage::new(10_000, 10_000))
            .is_zero());
    }
}
