use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
///
/// All fractional simulation state (throughput carries, token buckets,
/// probabilities, health scores) uses this type so runs are bit-identical
/// across platforms.
pub type Fixed64 = I32F32;

/// Convert an f64 to Fixed64. Use only for configuration defaults and test
/// setup, never inside the tick loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only at reporting boundaries (snapshots).
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Clamp a Fixed64 to [0, 1]. Failure rates, hit rates, and health scores
/// all live in this range.
#[inline]
pub fn clamp01(v: Fixed64) -> Fixed64 {
    v.clamp(Fixed64::ZERO, Fixed64::ONE)
}

/// Split a fractional budget into the whole count to spend this tick and the
/// remainder to carry forward.
#[inline]
pub fn split_budget(budget: Fixed64) -> (u32, Fixed64) {
    let whole = budget.int().to_num::<i64>().max(0) as u32;
    (whole, budget.frac())
}
