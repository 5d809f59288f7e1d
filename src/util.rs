const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// Truncates `f` to an integer, or None past 2^53 - 1 in magnitude where floats stop being exact.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.abs() <= FLOAT_TO_INT_MAX {
        Some(f as i64)
    } else {
        None
    }
}

/// Renders a number the way users write it in rules: integral values lose their fractional part,
/// so `42.0` and `"42"` compare equal as strings.
#[allow(clippy::float_cmp)]
pub(crate) fn format_number(f: f64) -> String {
    match f64_to_i64_safe(f) {
        Some(i) if i as f64 == f => i.to_string(),
        _ => f.to_string(),
    }
}

/// Ratio of two counters that is 0 rather than NaN when the denominator is 0.
pub(crate) fn safe_ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub(crate) fn is_false(b: &bool) -> bool {
    !(*b)
}
