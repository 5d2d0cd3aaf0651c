//! Exponential backoff with jitter for step retries and limiter waits.
//!
//! Formula: `base_ms * 2^exponent + jitter`, `jitter ∈ [0, base_ms)`.

use std::time::Duration;

/// Cap on the exponential term so large exponents cannot overflow.
const MAX_BACKOFF_MS: u64 = 60_000;

/// Compute a backoff delay.
///
/// `exponent` is `attempt - 1` for step retries (first retry waits
/// roughly `base_ms`) and `attempt` for limiter retries. `seed` spreads
/// the jitter between concurrent callers; pass something caller-unique.
pub fn backoff_with_jitter(base_ms: u64, exponent: u32, seed: u64) -> Duration {
    let exp = base_ms
        .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX))
        .min(MAX_BACKOFF_MS);
    let jitter = if base_ms > 0 {
        pseudo_rand(seed ^ exponent as u64) % base_ms
    } else {
        0
    };
    Duration::from_millis(exp + jitter)
}

/// Simple LCG (Numerical Recipes parameters) — avoids a `rand` dependency
/// for a jitter spread that only needs to be uncorrelated, not secure.
fn pseudo_rand(seed: u64) -> u64 {
    const A: u64 = 6_364_136_223_846_793_005;
    const C: u64 = 1_442_695_040_888_963_407;
    A.wrapping_mul(seed).wrapping_add(C) >> 16
}

/// Stable per-step jitter seed.
pub fn seed_for(step_id: &str, attempt: u32) -> u64 {
    // FNV-1a over the id, folded with the attempt.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in step_id.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash ^ attempt as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_within_jitter_bounds() {
        let base = 100;
        for exponent in 0..5u32 {
            let d = backoff_with_jitter(base, exponent, 42).as_millis() as u64;
            let floor = base * (1 << exponent);
            assert!(d >= floor, "exp {exponent}: {d} < {floor}");
            assert!(d < floor + base, "exp {exponent}: {d} >= {}", floor + base);
        }
    }

    #[test]
    fn capped_at_max() {
        let d = backoff_with_jitter(1_000, 63, 7).as_millis() as u64;
        assert!(d <= MAX_BACKOFF_MS + 1_000);
    }

    #[test]
    fn zero_base_means_zero_wait() {
        assert_eq!(backoff_with_jitter(0, 3, 1), Duration::ZERO);
    }

    #[test]
    fn seeds_differ_across_steps_and_attempts() {
        let a = seed_for("step-a", 1);
        let b = seed_for("step-b", 1);
        let c = seed_for("step-a", 2);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
