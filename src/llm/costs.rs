//! Per-token pricing by model family (USD).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) cost per token for a model name, matched by family.
pub fn model_cost(model: &str) -> Option<(Decimal, Decimal)> {
    let model = model.to_lowercase();
    if model.contains("opus") {
        Some((dec!(0.000015), dec!(0.000075)))
    } else if model.contains("sonnet") {
        Some((dec!(0.000003), dec!(0.000015)))
    } else if model.contains("haiku") {
        Some((dec!(0.0000008), dec!(0.000004)))
    } else {
        None
    }
}

/// Cost used when a model isn't in the table.
pub fn default_cost() -> (Decimal, Decimal) {
    (dec!(0.000003), dec!(0.000015))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_families() {
        assert_eq!(
            model_cost("claude-sonnet-4-20250514"),
            Some((dec!(0.000003), dec!(0.000015)))
        );
        assert!(model_cost("claude-3-5-haiku-latest").is_some());
        assert!(model_cost("Claude-Opus-4").is_some());
    }

    #[test]
    fn unknown_model() {
        assert_eq!(model_cost("mystery-model"), None);
    }
}
