// =============================================================================
// Price / quantity rounding against symbol filters
// =============================================================================
//
// The venue rejects any price that is not an exact multiple of the tick
// size and any quantity off the lot step. Everything rounds DOWN so a
// rounded value can never breach a filter from above, and the result is
// re-quantized to the increment's decimal count to shed float residue.
// =============================================================================

/// Decimal places implied by an increment like 0.001 → 3.
pub fn decimals_of(increment: f64) -> i32 {
    if increment <= 0.0 {
        return 0;
    }
    (-increment.log10()).round().max(0.0) as i32
}

fn quantize(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Round `value` down to a multiple of `increment`. Values already on a
/// multiple (within float tolerance) are preserved rather than dropped a
/// full step.
pub fn round_down_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    let ratio = value / increment;
    let units = if (ratio - ratio.round()).abs() < 1e-6 {
        ratio.round()
    } else {
        ratio.floor()
    };
    quantize(units * increment, decimals_of(increment))
}

/// True when `value` is an exact multiple of `increment` within float
/// tolerance.
pub fn is_multiple_of(value: f64, increment: f64) -> bool {
    if increment <= 0.0 {
        return false;
    }
    let ratio = value / increment;
    (ratio - ratio.round()).abs() < 1e-6
}
