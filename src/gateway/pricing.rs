//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Provider name.
    pub provider: &'static str,
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(provider: &'static str, input: i64, output: i64) -> Self {
        Self {
            provider,
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

// OpenAI
// GPT-4o: $2.50/1M input, $10.00/1M output
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
const GPT_4O: ModelPricing = ModelPricing::new("openai", 2_500, 10_000);
const GPT_4O_MINI: ModelPricing = ModelPricing::new("openai", 150, 600);

// Perplexity (per-request search fees not included)
// llama-3.1-sonar-small-128k-online: $0.20/1M both ways
// sonar: $1/1M both ways, sonar-pro: $3/1M input, $15/1M output
const SONAR_SMALL_ONLINE: ModelPricing = ModelPricing::new("perplexity", 200, 200);
const SONAR_LARGE_ONLINE: ModelPricing = ModelPricing::new("perplexity", 1_000, 1_000);
const SONAR: ModelPricing = ModelPricing::new("perplexity", 1_000, 1_000);
const SONAR_PRO: ModelPricing = ModelPricing::new("perplexity", 3_000, 15_000);

// OpenRouter passthrough
const OR_GPT_4O: ModelPricing = ModelPricing::new("openrouter", 2_500, 10_000);
const OR_GPT_4O_MINI: ModelPricing = ModelPricing::new("openrouter", 150, 600);
const OR_CLAUDE_35_SONNET: ModelPricing = ModelPricing::new("openrouter", 3_000, 15_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("gpt-4o", GPT_4O);
    map.insert("gpt-4o-2024-08-06", GPT_4O);
    map.insert("gpt-4o-mini", GPT_4O_MINI);
    map.insert("gpt-4o-mini-2024-07-18", GPT_4O_MINI);

    map.insert("llama-3.1-sonar-small-128k-online", SONAR_SMALL_ONLINE);
    map.insert("llama-3.1-sonar-large-128k-online", SONAR_LARGE_ONLINE);
    map.insert("sonar", SONAR);
    map.insert("sonar-pro", SONAR_PRO);

    map.insert("openai/gpt-4o", OR_GPT_4O);
    map.insert("openai/gpt-4o-mini", OR_GPT_4O_MINI);
    map.insert("anthropic/claude-3-5-sonnet", OR_CLAUDE_35_SONNET);
    map.insert("perplexity/sonar", SONAR);

    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate chat cost.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    // Default to a mid-range model if unknown
    let default = ModelPricing::new("unknown", 1_000, 5_000);
    let pricing = get_pricing(model).unwrap_or(default);
    pricing.calculate_cost(input_tokens, output_tokens)
}
