//! Linear mapping from real-world statistic ranges onto the small
//! fixed-point attribute scales the game formats use (0-6 nibbles on the
//! cartridges, 0-63 six-bit fields on the disc target).

/// Map `value` clamped to `[low, high]` onto `0..=out_max`, rounding to
/// the nearest integer. A degenerate range (`high <= low`) yields the
/// midpoint of the output scale instead of dividing by zero.
pub fn scale(value: f64, low: f64, high: f64, out_max: u32) -> u32 {
    if high <= low {
        return (out_max + 1) / 2;
    }

    let v = value.clamp(low, high);
    let ratio = (v - low) / (high - low);
    (ratio * out_max as f64).round() as u32
}

/// Clamp a possibly-boosted attribute back into `0..=hi`.
pub fn clamp_attr(value: i32, hi: u32) -> u32 {
    value.clamp(0, hi as i32) as u32
}
