//! Per-model token prices (USD per token).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Look up the (input, output) per-token cost for a model.
///
/// Matching is by prefix so dated snapshots share their family's price.
pub fn model_cost(model: &str) -> Option<(Decimal, Decimal)> {
    let table: &[(&str, Decimal, Decimal)] = &[
        ("claude-opus-4", dec!(0.000015), dec!(0.000075)),
        ("claude-sonnet-4", dec!(0.000003), dec!(0.000015)),
        ("claude-3-7-sonnet", dec!(0.000003), dec!(0.000015)),
        ("claude-3-5-sonnet", dec!(0.000003), dec!(0.000015)),
        ("claude-3-5-haiku", dec!(0.0000008), dec!(0.000004)),
        ("claude-haiku-4", dec!(0.000001), dec!(0.000005)),
        ("gpt-4o-mini", dec!(0.00000015), dec!(0.0000006)),
        ("gpt-4o", dec!(0.0000025), dec!(0.00001)),
        ("gpt-4.1-mini", dec!(0.0000004), dec!(0.0000016)),
        ("gpt-4.1", dec!(0.000002), dec!(0.000008)),
        ("o3-mini", dec!(0.0000011), dec!(0.0000044)),
    ];

    table
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, input, output)| (*input, *output))
}

/// Fallback for unknown models, priced like a mid-tier model.
pub fn default_cost() -> (Decimal, Decimal) {
    (dec!(0.000003), dec!(0.000015))
}
