use std::collections::BTreeSet;

/// Integer division rounding up. Division by zero yields zero.
pub fn ceil_div(a: u64, b: u64) -> u64 {
    if b == 0 {
        return 0;
    }
    divrem::DivCeil::div_ceil(a, b)
}

/// Rounds `a` up to the next multiple of `b`. Zero `b` yields zero.
pub fn align_up(a: u64, b: u64) -> u64 {
    ceil_div(a, b) * b
}

pub const fn bit_length(n: u64) -> u32 {
    u64::BITS - n.leading_zeros()
}

/// Yields 1, 2, 4, ... up to and including the largest power of two `<= n`.
pub fn iter_powers_of_two(n: u64) -> impl Iterator<Item = u64> + DoubleEndedIterator + Clone {
    (0..bit_length(n)).map(|b| 1u64 << b)
}

/// Returns the factors of an integer, in ascending order.
pub fn factors(x: u64) -> Vec<u64> {
    comm_factors(x, x)
}

/// Returns the factors of `num` which are no greater than `max`, ascending.
pub fn comm_factors(num: u64, max: u64) -> Vec<u64> {
    let mut result = Vec::new();
    let mut i = 1;
    while i <= num / i {
        if num % i == 0 {
            if i <= max {
                result.push(i);
            }
            let right = num / i;
            if right != i && right <= max {
                result.push(right);
            }
        }
        i += 1;
    }
    result.sort_unstable();
    result
}

/// Like [comm_factors], but also admits every power of two no greater than
/// both `num` and `max`. Sorted and deduplicated.
pub fn comm_factors_with_powers_of_two(num: u64, max: u64) -> Vec<u64> {
    let mut result = comm_factors(num, max);
    result.extend(iter_powers_of_two(num.min(max)));
    result.sort_unstable();
    result.dedup();
    result
}

/// Merges the members of `mix` which are `<= org_dim` into `range`, returning
/// an ascending, deduplicated list.
pub fn mix_factors(org_dim: u64, range: &[u64], mix: &[u64]) -> Vec<u64> {
    let mut merged = range.iter().copied().collect::<BTreeSet<_>>();
    merged.extend(mix.iter().copied().filter(|&v| v <= org_dim));
    merged.into_iter().collect()
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple. Returns `None` on overflow; zero if either is zero.
pub fn lcm(a: u64, b: u64) -> Option<u64> {
    if a == 0 || b == 0 {
        return Some(0);
    }
    (a / gcd(a, b)).checked_mul(b)
}

pub fn checked_product(values: &[u64]) -> Option<u64> {
    values.iter().try_fold(1u64, |acc, &v| acc.checked_mul(v))
}

/// Input rows needed in L1 to produce `ho_l1` output rows, clamped to the
/// full input height.
pub fn infer_hi_l1(ho_l1: u64, hi: u64, kh: u64, dilation_h: u64, stride_h: u64) -> u64 {
    let kh_dilated = (kh.saturating_sub(1)) * dilation_h + 1;
    let hi_l1 = ho_l1.saturating_sub(1) * stride_h + kh_dilated;
    hi_l1.min(hi)
}

/// Column counterpart of [infer_hi_l1].
pub fn infer_wi_l1(wo_l1: u64, wi: u64, kw: u64, dilation_w: u64, stride_w: u64) -> u64 {
    let kw_dilated = (kw.saturating_sub(1)) * dilation_w + 1;
    let wi_l1 = wo_l1.saturating_sub(1) * stride_w + kw_dilated;
    wi_l1.min(wi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_factors_of_aicore_counts() {
        assert_eq!(factors(24), vec![1, 2, 3, 4, 6, 8, 12, 24]);
        assert_eq!(factors(32), vec![1, 2, 4, 8, 16, 32]);
        assert_eq!(factors(1), vec![1]);
        assert!(factors(0).is_empty());
    }

    #[test]
    fn test_comm_factors_respects_max() {
        assert_eq!(comm_factors(12, 5), vec![1, 2, 3, 4]);
        assert_eq!(comm_factors(7, 32), vec![1, 7]);
    }

    #[test]
    fn test_comm_factors_with_powers_of_two() {
        assert_eq!(comm_factors_with_powers_of_two(11, 8), vec![1, 2, 4, 8]);
        assert_eq!(comm_factors_with_powers_of_two(11, 32), vec![1, 2, 4, 8, 11]);
        assert_eq!(comm_factors_with_powers_of_two(12, 12), vec![1, 2, 3, 4, 6, 8, 12]);
    }

    #[test]
    fn test_mix_factors_drops_oversized() {
        assert_eq!(mix_factors(5, &[1, 5], &[1, 2, 4, 8]), vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_lcm_and_gcd() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(lcm(4, 6), Some(12));
        assert_eq!(lcm(u64::MAX, 2), None);
    }

    #[test]
    fn test_infer_hi_l1_clamps_to_input() {
        assert_eq!(infer_hi_l1(2, 32, 3, 1, 1), 4);
        assert_eq!(infer_hi_l1(100, 32, 3, 1, 1), 32);
        assert_eq!(infer_wi_l1(4, 64, 3, 2, 2), 11);
    }

    proptest! {
        #[test]
        fn test_comm_factors_divide_and_bounded(num in 1u64..5000, max in 1u64..5000) {
            let f = comm_factors(num, max);
            prop_assert!(f.windows(2).all(|w| w[0] < w[1]));
            for v in f {
                prop_assert_eq!(num % v, 0);
                prop_assert!(v <= max);
            }
        }

        #[test]
        fn test_align_up_is_multiple(a in 0u64..1_000_000, b in 1u64..1000) {
            let r = align_up(a, b);
            prop_assert_eq!(r % b, 0);
            prop_assert!(r >= a && r - a < b);
        }
    }
}
