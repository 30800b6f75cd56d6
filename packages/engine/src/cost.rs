use serde_json::Value;

/// Credits per token for known models; anything unrecognized costs zero
/// (the spend is still token-tracked, just not billed).
const MODEL_RATES: &[(&str, f64)] = &[
    ("gpt-4o", 0.00001),
    ("gpt-4o-mini", 0.0000006),
    ("claude-3-5-sonnet", 0.000009),
    ("claude-3-5-haiku", 0.000003),
];

pub fn model_rate(model: &str) -> f64 {
    MODEL_RATES
        .iter()
        .find(|(name, _)| model.starts_with(name))
        .map(|(_, rate)| *rate)
        .unwrap_or(0.0)
}

/// Tokens consumed by a step: read from upstream response metadata when
/// present, otherwise estimated from the serialized output size (~4 bytes
/// per token).
pub fn tokens_for_output(output: &Value) -> u64 {
    if let Some(tokens) = metadata_tokens(output) {
        return tokens;
    }
    estimate_tokens(output)
}

fn metadata_tokens(output: &Value) -> Option<u64> {
    let obj = output.as_object()?;

    for key in ["tokensUsed", "tokens_used"] {
        if let Some(tokens) = obj.get(key).and_then(Value::as_u64) {
            return Some(tokens);
        }
    }

    for container in ["metadata", "usage"] {
        if let Some(inner) = obj.get(container).and_then(Value::as_object) {
            for key in ["tokensUsed", "tokens_used", "totalTokens", "total_tokens"] {
                if let Some(tokens) = inner.get(key).and_then(Value::as_u64) {
                    return Some(tokens);
                }
            }
        }
    }

    None
}

pub fn estimate_tokens(output: &Value) -> u64 {
    let size = match output {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    (size as u64).div_ceil(4)
}

pub fn credits_for(tokens: u64, model: Option<&str>) -> f64 {
    match model {
        Some(model) => tokens as f64 * model_rate(model),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_tokens_take_precedence() {
        let output = json!({"data": "x".repeat(400), "usage": {"total_tokens": 7}});
        assert_eq!(tokens_for_output(&output), 7);
    }

    #[test]
    fn estimates_from_size_when_unmetered() {
        let output = json!("abcdefgh");
        assert_eq!(tokens_for_output(&output), 2);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        assert_eq!(credits_for(1000, Some("mystery-model")), 0.0);
        assert_eq!(credits_for(1000, None), 0.0);
        assert!(credits_for(1000, Some("gpt-4o")) > 0.0);
    }
}
