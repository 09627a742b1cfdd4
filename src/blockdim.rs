//! Splitting the output iteration space across AI cores.
//!
//! Five axes are split independently: batch, M (flattened Ho*Wo, or Ho in HW
//! mode), N (output channels), output depth, and folded groups. Candidate
//! split counts per axis are small divisor sets; every combination whose
//! product fits the core count is scored with a memory-traffic estimate and
//! the cheapest wins.

use crate::common::{CubeInfo, OutputOrder};
use crate::shape::{GroupOpt, ShapeInfo};
use crate::utils::{ceil_div, comm_factors, factors, mix_factors};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

/// Batch extents at least this many times the core count split on any
/// factor of the core count.
const BATCH_AICORE_COF: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BlockDimResult {
    pub batch_dim: u64,
    pub m_dim: u64,
    pub n_dim: u64,
    pub do_dim: u64,
    pub group_dim: u64,
    pub cost: u64,
}

/// Candidate split counts per axis, each ascending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockDimRanges {
    pub aic: Vec<u64>,
    pub batch: Vec<u64>,
    pub m: Vec<u64>,
    pub n: Vec<u64>,
    pub dout: Vec<u64>,
    pub group: Vec<u64>,
}

/// Everything the block-dim search reads.
#[derive(Debug, Clone, Copy)]
pub struct BlockDimProblem<'a> {
    pub shape: &'a ShapeInfo,
    pub group: &'a GroupOpt,
    pub cube: CubeInfo,
    pub order: OutputOrder,
    pub groups: u64,
    pub aicore_num: u64,
    pub l2_rate: u64,
}

impl Default for BlockDimResult {
    fn default() -> Self {
        BlockDimResult {
            batch_dim: 1,
            m_dim: 1,
            n_dim: 1,
            do_dim: 1,
            group_dim: 1,
            cost: u64::MAX,
        }
    }
}

impl BlockDimResult {
    pub fn core_count(&self) -> u64 {
        self.batch_dim * self.m_dim * self.n_dim * self.do_dim * self.group_dim
    }

    fn from_dims(dims: &[u64], cost: u64) -> Self {
        BlockDimResult {
            batch_dim: dims[0],
            m_dim: dims[1],
            n_dim: dims[2],
            do_dim: dims[3],
            group_dim: dims[4],
            cost,
        }
    }

    /// Equal-cost preference: more batch splits, then more group splits,
    /// then more depth splits.
    fn wins_tie_against(&self, best: &BlockDimResult) -> bool {
        if self.batch_dim != best.batch_dim {
            return self.batch_dim > best.batch_dim;
        }
        if self.group_dim != best.group_dim {
            return self.group_dim > best.group_dim;
        }
        self.do_dim > best.do_dim
    }
}

impl<'a> BlockDimProblem<'a> {
    fn ci1(&self) -> u64 {
        ceil_div(self.group.cin_opt, self.cube.k0)
    }

    fn co1(&self) -> u64 {
        ceil_div(self.group.cout_opt, self.cube.n0)
    }

    pub fn ranges(&self) -> BlockDimRanges {
        let aic = factors(self.aicore_num);
        let max = self.aicore_num;
        let shape = self.shape;

        let batch = if shape.batch >= BATCH_AICORE_COF * max {
            aic.clone()
        } else {
            mix_factors(shape.batch, &comm_factors(shape.batch, max), &aic)
        };
        let n = comm_factors(self.co1(), max);
        let m = match self.order {
            OutputOrder::M => {
                let m1 = ceil_div(shape.ho * shape.wo, self.cube.m0);
                mix_factors(m1, &comm_factors(m1, max), &aic)
            }
            OutputOrder::Hw => mix_factors(shape.ho, &comm_factors(shape.ho, max), &aic),
        };
        let dout = mix_factors(shape.dout, &comm_factors(shape.dout, max), &aic);
        let group = if self.groups == 1 {
            vec![1]
        } else {
            comm_factors(self.group.group_opt, max)
        };
        BlockDimRanges {
            aic,
            batch,
            m,
            n,
            dout,
            group,
        }
    }

    /// Every `[batch, m, n, do, group]` combination (batch outermost) whose
    /// product fits the core count. Prefixes that already exceed it are
    /// dropped before the next axis is expanded.
    pub fn candidates(&self, ranges: &BlockDimRanges) -> Vec<[u64; 5]> {
        let aicore_num = self.aicore_num;
        let axes = [
            &ranges.batch,
            &ranges.m,
            &ranges.n,
            &ranges.dout,
            &ranges.group,
        ];
        let mut frontier = vec![([1u64; 5], 1u64)];
        for (axis, range) in axes.into_iter().enumerate() {
            let range: &[u64] = if range.is_empty() { &[1] } else { range.as_slice() };
            frontier = frontier
                .into_iter()
                .cartesian_product(range.iter().copied())
                .filter_map(|((mut dims, product), v)| {
                    let product = product.checked_mul(v).filter(|&p| p <= aicore_num)?;
                    dims[axis] = v;
                    Some((dims, product))
                })
                .collect();
        }
        frontier.into_iter().map(|(dims, _)| dims).collect()
    }

    /// Estimated traffic for one split, in units of L2-scaled bytes.
    pub fn total_cost(&self, dims: &[u64]) -> u64 {
        let s = self.shape;
        let [bd, md, nd, dd, gd] = [dims[0], dims[1], dims[2], dims[3], dims[4]].map(|v| v as f64);
        let l2 = self.l2_rate.max(1) as f64;
        let (k0, n0) = (self.cube.k0 as f64, self.cube.n0 as f64);
        let (ci1, co1) = (self.ci1() as f64, self.co1() as f64);
        let (batch, dout) = (s.batch as f64, s.dout as f64);
        let (kd, kh, kw) = (s.kd as f64, s.kh as f64, s.kw as f64);

        let fmap = batch / bd * dout / dd * (s.hi * s.wi) as f64 / md * (kd * ci1 * k0) / l2;
        let weight = (co1 * n0) / nd * (kd * ci1 * kh * kw * k0) * batch / bd / l2;
        let output = batch / bd * (co1 * n0) / nd * dout / dd * (s.ho * s.wo) as f64 / md / l2;
        let single_m1 = match self.order {
            OutputOrder::M => ceil_div(s.ho * s.wo, self.cube.m0) as f64 / md,
            OutputOrder::Hw => {
                ceil_div(ceil_div(s.ho, dims[1]) * s.wo, self.cube.m0) as f64
            }
        };
        let cube = batch / bd * co1 / nd * dout / dd * (kd * ci1 * kh * kw) * single_m1;

        let mut total = fmap + weight + output + cube;
        if self.groups != 1 {
            total *= self.group.group_opt as f64 / gd;
        }
        total as u64
    }

    pub fn decide(&self) -> BlockDimResult {
        let ranges = self.ranges();
        let mut best = BlockDimResult::default();
        for dims in self.candidates(&ranges) {
            let candidate = BlockDimResult::from_dims(&dims, self.total_cost(&dims));
            if candidate.cost < best.cost
                || (candidate.cost == best.cost && candidate.wins_tie_against(&best))
            {
                best = candidate;
            }
        }
        debug!(
            "block dims: batch={} m={} n={} do={} group={} cost={}",
            best.batch_dim, best.m_dim, best.n_dim, best.do_dim, best.group_dim, best.cost
        );
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use proptest::prelude::*;

    fn shape(batch: u64, dout: u64, ho: u64, wo: u64, cout: u64) -> ShapeInfo {
        ShapeInfo {
            batch,
            cin: 64,
            di: dout * 2,
            hi: ho * 2,
            wi: wo * 2,
            cout,
            kd: 3,
            kh: 3,
            kw: 3,
            dout,
            ho,
            wo,
        }
    }

    fn decide(shape: &ShapeInfo, group: &GroupOpt, groups: u64, aicore_num: u64) -> BlockDimResult {
        BlockDimProblem {
            shape,
            group,
            cube: Dtype::Bf16.cube_info().unwrap(),
            order: OutputOrder::M,
            groups,
            aicore_num,
            l2_rate: 100,
        }
        .decide()
    }

    #[test]
    fn test_single_core_is_all_ones() {
        let s = shape(32, 16, 64, 64, 128);
        let g = GroupOpt {
            group_opt: 1,
            cin_opt: 64,
            cout_opt: 128,
        };
        let result = decide(&s, &g, 1, 1);
        assert_eq!(result.core_count(), 1);
        assert_eq!(
            (result.batch_dim, result.m_dim, result.n_dim, result.do_dim, result.group_dim),
            (1, 1, 1, 1, 1)
        );
    }

    #[test]
    fn test_large_batch_uses_every_core() {
        let s = shape(32, 16, 64, 64, 128);
        let g = GroupOpt {
            group_opt: 1,
            cin_opt: 64,
            cout_opt: 128,
        };
        let result = decide(&s, &g, 1, 32);
        assert_eq!(result.core_count(), 32);
    }

    #[test]
    fn test_ranges_mix_in_core_factors() {
        let s = shape(3, 5, 4, 4, 16);
        let g = GroupOpt {
            group_opt: 1,
            cin_opt: 64,
            cout_opt: 16,
        };
        let problem = BlockDimProblem {
            shape: &s,
            group: &g,
            cube: Dtype::Bf16.cube_info().unwrap(),
            order: OutputOrder::M,
            groups: 1,
            aicore_num: 8,
            l2_rate: 1,
        };
        let ranges = problem.ranges();
        assert_eq!(ranges.aic, vec![1, 2, 4, 8]);
        assert_eq!(ranges.batch, vec![1, 2, 3]);
        assert_eq!(ranges.dout, vec![1, 2, 4, 5]);
        assert_eq!(ranges.n, vec![1]);
        assert_eq!(ranges.group, vec![1]);
    }

    #[test]
    fn test_candidates_stay_within_core_count() {
        let s = shape(3, 5, 4, 4, 16);
        let g = GroupOpt {
            group_opt: 1,
            cin_opt: 64,
            cout_opt: 16,
        };
        let problem = BlockDimProblem {
            shape: &s,
            group: &g,
            cube: Dtype::Bf16.cube_info().unwrap(),
            order: OutputOrder::M,
            groups: 1,
            aicore_num: 8,
            l2_rate: 1,
        };
        let ranges = BlockDimRanges {
            batch: vec![1, 2, 3],
            m: vec![1, 2, 4, 8],
            n: vec![],
            dout: vec![1, 2, 4, 5],
            group: vec![1],
            ..BlockDimRanges::default()
        };
        let candidates = problem.candidates(&ranges);
        assert_eq!(candidates.first(), Some(&[1, 1, 1, 1, 1]));
        assert!(candidates.contains(&[2, 4, 1, 1, 1]));
        assert!(candidates.contains(&[1, 1, 1, 5, 1]));
        assert!(!candidates.contains(&[3, 1, 1, 4, 1]));
        assert!(candidates
            .iter()
            .all(|dims| dims.iter().product::<u64>() <= 8 && dims[2] == 1));
        // Brute force over the same ranges agrees on the count.
        let brute = ranges
            .batch
            .iter()
            .cartesian_product(&ranges.m)
            .cartesian_product(&ranges.dout)
            .filter(|&((&b, &m), &d)| b * m * d <= 8)
            .count();
        assert_eq!(candidates.len(), brute);
    }

    proptest! {
        #[test]
        fn test_block_dims_fit_core_count(
            batch in 1u64..64,
            dout in 1u64..32,
            ho in 1u64..64,
            cout in 1u64..512,
            group_opt in 1u64..8,
            aicore_num in 1u64..48,
        ) {
            let s = shape(batch, dout, ho, ho, cout);
            let g = GroupOpt { group_opt, cin_opt: 16, cout_opt: cout };
            let groups = if group_opt == 1 { 1 } else { group_opt * 2 };
            let result = decide(&s, &g, groups, aicore_num);
            prop_assert!(result.core_count() <= aicore_num);
            prop_assert!(result.core_count() >= 1);
        }
    }
}
