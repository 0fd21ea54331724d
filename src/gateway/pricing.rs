//! Model pricing registry.
//!
//! Token prices used for the immediate cost estimate of a call. The provider's
//! billed cost replaces the estimate later (see `jobs::reconcile`).
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Nanodollars per US dollar.
pub const NANOS_PER_USD: f64 = 1_000_000_000.0;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// OpenRouter list prices, USD per 1M tokens (input / output).
// $1.00/1M tokens = 1,000 nanodollars/token.

// GPT-5.1: $1.25 / $10.00
const GPT_5_1: ModelPricing = ModelPricing::new(1_250, 10_000);
// Gemini 3 Pro preview: $2.00 / $12.00
const GEMINI_3_PRO_PREVIEW: ModelPricing = ModelPricing::new(2_000, 12_000);
// Claude Sonnet 4.5: $3.00 / $15.00
const CLAUDE_SONNET_4_5: ModelPricing = ModelPricing::new(3_000, 15_000);
// Grok 4: $3.00 / $15.00
const GROK_4: ModelPricing = ModelPricing::new(3_000, 15_000);
// Gemini 2.5 Flash: $0.30 / $2.50
const GEMINI_2_5_FLASH: ModelPricing = ModelPricing::new(300, 2_500);

/// Fallback for models missing from the registry: $1.00 / $3.00.
pub const DEFAULT_PRICING: ModelPricing = ModelPricing::new(1_000, 3_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("openai/gpt-5.1", GPT_5_1);
    map.insert("google/gemini-3-pro-preview", GEMINI_3_PRO_PREVIEW);
    map.insert("anthropic/claude-sonnet-4.5", CLAUDE_SONNET_4_5);
    map.insert("x-ai/grok-4", GROK_4);
    map.insert("google/gemini-2.5-flash", GEMINI_2_5_FLASH);

    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Estimated chat cost in nanodollars.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(DEFAULT_PRICING)
        .calculate_cost(input_tokens, output_tokens)
}

/// Convert a provider-reported USD amount to nanodollars, clamped at zero.
pub fn usd_to_nanodollars(usd: f64) -> i64 {
    if !usd.is_finite() {
        return 0;
    }
    ((usd * NANOS_PER_USD).round() as i64).max(0)
}
