use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CURRENCY_USD: &str = "USD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pricing {
    /// Input and output rates per 1000 tokens.
    Split { input: Decimal, output: Decimal },
    /// One rate per 1000 tokens for legacy completion models.
    Blended(Decimal),
}

/// Per-1000-token USD prices. `None` for models we do not price.
pub fn price_per_1k(model: &str) -> Option<Pricing> {
    let split = |input: Decimal, output: Decimal| Some(Pricing::Split { input, output });
    match model {
        "text-ada-001" => Some(Pricing::Blended(Decimal::new(4, 4))),
        "text-babbage-001" => Some(Pricing::Blended(Decimal::new(5, 4))),
        "text-curie-001" => Some(Pricing::Blended(Decimal::new(2, 3))),
        "code-cushman-001" => Some(Pricing::Blended(Decimal::new(24, 3))),
        "code-davinci-002" => Some(Pricing::Blended(Decimal::new(1, 1))),
        "text-davinci-002" | "text-davinci-003" => Some(Pricing::Blended(Decimal::new(2, 2))),
        "gpt-35-turbo" => Some(Pricing::Blended(Decimal::new(2, 3))),
        "gpt-3.5-turbo" | "gpt-3.5-turbo-0301" | "gpt-3.5-turbo-0613" => {
            split(Decimal::new(15, 4), Decimal::new(2, 3))
        }
        "gpt-3.5-turbo-16k" | "gpt-3.5-turbo-16k-0613" => {
            split(Decimal::new(3, 3), Decimal::new(4, 3))
        }
        "gpt-4" | "gpt-4-0314" | "gpt-4-0613" => split(Decimal::new(3, 2), Decimal::new(6, 2)),
        "gpt-4-32k" | "gpt-4-32k-0314" | "gpt-4-32k-0613" => {
            split(Decimal::new(6, 2), Decimal::new(12, 2))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub price: Decimal,
    pub currency: String,
}

impl UsageRecord {
    pub fn new(model: impl Into<String>, prompt_tokens: u64, completion_tokens: u64) -> Self {
        let model = model.into();
        let price = cost(&model, prompt_tokens, completion_tokens);
        Self {
            model,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            price,
            currency: CURRENCY_USD.to_string(),
        }
    }

    /// Reads an OpenAI-style `usage` object. `completion_tokens` defaults to
    /// zero and `total_tokens` to the sum; an upstream-reported total wins.
    pub fn from_usage_value(model: impl Into<String>, usage: &Value) -> Option<Self> {
        let prompt_tokens = usage.get("prompt_tokens")?.as_u64()?;
        let completion_tokens = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let mut record = Self::new(model, prompt_tokens, completion_tokens);
        if let Some(total) = usage.get("total_tokens").and_then(|v| v.as_u64()) {
            record.total_tokens = total;
        }
        Some(record)
    }
}

/// USD cost of a call; zero for unpriced models.
pub fn cost(model: &str, input_tokens: u64, output_tokens: u64) -> Decimal {
    let thousand = Decimal::from(1000u32);
    let total = match price_per_1k(model) {
        Some(Pricing::Split { input, output }) => {
            (input * Decimal::from(input_tokens) + output * Decimal::from(output_tokens)) / thousand
        }
        Some(Pricing::Blended(rate)) => {
            rate * (Decimal::from(input_tokens) + Decimal::from(output_tokens)) / thousand
        }
        None => Decimal::ZERO,
    };
    total.normalize()
}
