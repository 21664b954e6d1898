//! Ceiling computation for child allocations.
//!
//! A child's ceiling is fixed when it is spawned: at most a configured
//! fraction of the parent's own ceiling and always strictly below it.

/// Largest ceiling a child of a `parent_total` allocation may receive.
///
/// # Pure Function
/// `result < parent_total` whenever `parent_total > 0`.
pub fn ceiling_cap(parent_total: u64, fraction: f64) -> u64 {
    if parent_total == 0 {
        return 0;
    }
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let cap = ((parent_total as f64) * fraction).floor() as u64;
    cap.min(parent_total - 1)
}

/// Ceiling granted to a child, given an optional requested amount.
///
/// Requests above the cap are clamped down; absent requests receive
/// `default_amount` (or the cap itself), also clamped.
pub fn child_ceiling(
    parent_total: u64,
    requested: Option<u64>,
    default_amount: Option<u64>,
    fraction: f64,
) -> u64 {
    let cap = ceiling_cap(parent_total, fraction);
    requested.or(default_amount).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_is_strictly_below_parent() {
        assert_eq!(ceiling_cap(100, 1.0), 99);
        assert_eq!(ceiling_cap(100, 0.5), 50);
        assert_eq!(ceiling_cap(1, 0.5), 0);
        assert_eq!(ceiling_cap(0, 0.5), 0);
    }

    #[test]
    fn test_requested_amount_is_clamped() {
        assert_eq!(child_ceiling(250, Some(100), None, 0.5), 100);
        assert_eq!(child_ceiling(250, Some(200), None, 0.5), 125);
        assert_eq!(child_ceiling(250, None, Some(80), 0.5), 80);
        assert_eq!(child_ceiling(250, None, None, 0.5), 125);
    }

    #[test]
    fn test_nonsense_fraction_grants_nothing() {
        assert_eq!(ceiling_cap(1000, f64::NAN), 0);
        assert_eq!(ceiling_cap(1000, -1.0), 0);
    }
}
