//! L1 tile selection: how much of the fmap (A) and weight (B) K, M and N
//! extents sit in L1 at once, and whether the weight skips L1 entirely.

use super::algorithm::{step_back, L1Decision, L1FullLoad, L1Indices, L1Ranges, Solver};
use crate::common::IterateOrder;
use crate::error::{fail, TilingError};
use crate::utils::{align_up, ceil_div, checked_product, factors};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    KA,
    KB,
    MA,
    NB,
}

impl L1Indices {
    fn at_mut(&mut self, axis: Axis) -> &mut usize {
        match axis {
            Axis::KA => &mut self.k_a,
            Axis::KB => &mut self.k_b,
            Axis::MA => &mut self.m_a,
            Axis::NB => &mut self.n_b,
        }
    }
}

impl L1Ranges {
    fn len(&self, axis: Axis) -> usize {
        match axis {
            Axis::KA => self.k_a.len(),
            Axis::KB => self.k_b.len(),
            Axis::MA => self.m_a.len(),
            Axis::NB => self.n_b.len(),
        }
    }

    fn last(&self, axis: Axis) -> usize {
        self.len(axis).saturating_sub(1)
    }
}

/// Saturating sum, so oversized operands compare as not fitting.
fn bytes(parts: &[u64]) -> u64 {
    parts.iter().fold(0u64, |acc, &p| acc.saturating_add(p))
}

fn overflow(what: &str) -> TilingError {
    TilingError::ArithmeticOverflow(format!("{what} L1 size exceeds u64"))
}

impl Solver<'_> {
    pub(super) fn init_l1_sizes(&mut self) -> Result<(), TilingError> {
        let ins = self.ins;
        let (k0, n0) = (ins.cube.k0, ins.cube.n0);
        let ci0_hk_wk = ins.kh * ins.kw * k0;
        let fmap_min_area = ins.fmap_l1_area(self.m_l0);

        let s = &mut self.sizes;
        s.ci0_hk_wk = ci0_hk_wk;
        s.align_cin_kh_kw_kd = align_up(ins.single_ci, k0) * ins.kh * ins.kw * ins.kd;
        s.fmap_full = checked_product(&[
            ins.kd,
            ins.single_ci1,
            ins.fmap_l1_area(ins.single_m),
            k0,
            ins.fmap_size,
        ])
        .ok_or_else(|| overflow("full fmap"))?;
        s.fmap_min = k0 * fmap_min_area * ins.fmap_size * self.pb.al1;
        s.fmap_k_full = checked_product(&[ins.kd, ins.single_ci1, s.fmap_min])
            .ok_or_else(|| overflow("full-K fmap"))?;
        s.weight_full = checked_product(&[
            ins.kd,
            ins.single_ci1,
            ci0_hk_wk,
            ins.single_co1,
            n0,
            ins.weight_size,
        ])
        .ok_or_else(|| overflow("full weight"))?;
        s.weight_min = ci0_hk_wk * self.n_l0 * self.pb.bl1 * ins.weight_size;
        s.weight_k_full = checked_product(&[ins.kd, ins.single_ci1, s.weight_min])
            .ok_or_else(|| overflow("full-K weight"))?;
        s.bias_min = if ins.has_bias {
            self.n_l0 * ins.bias_size
        } else {
            0
        };
        Ok(())
    }

    /// Candidate K extents are whole cin1 slices of one depth tap, or whole
    /// depth taps. The fmap side is also capped by the load3d post-K limit.
    pub(super) fn l1_tiling_range(&mut self) -> Result<(), TilingError> {
        let ins = self.ins;
        let ci1 = ins.single_ci1;
        let ci0_hk_wk = self.sizes.ci0_hk_wk;

        let mut k_range = factors(ci1);
        k_range.extend((2..=ins.kd).map(|dk| dk * ci1));
        let limit = (ins.caps.load3d.max_post_k + ins.cube.k0) / ci0_hk_wk;
        self.ranges.k_a = k_range
            .iter()
            .copied()
            .take_while(|&k| k <= limit)
            .map(|k| k * ci0_hk_wk)
            .collect();
        self.ranges.k_b = k_range.iter().map(|&k| k * ci0_hk_wk).collect();

        let n_multi = ceil_div(ins.n_full(), self.n_l0);
        self.ranges.n_b = factors(n_multi).into_iter().map(|v| v * self.n_l0).collect();
        let m_multi = ceil_div(ins.m_full(), self.m_l0);
        self.ranges.m_a = factors(m_multi).into_iter().map(|v| v * self.m_l0).collect();

        if self.ranges.k_a.is_empty()
            || self.ranges.k_b.is_empty()
            || self.ranges.m_a.is_empty()
            || self.ranges.n_b.is_empty()
        {
            return fail(TilingError::L1TilingInfeasible(format!(
                "empty L1 range (kh*kw*k0={ci0_hk_wk}, post-K limit {})",
                ins.caps.load3d.max_post_k
            )));
        }
        Ok(())
    }

    /// Decides which operands are held whole in L1. A whole operand is
    /// loaded once, so its double buffer is dropped.
    pub(super) fn init_l1_mode(&mut self) {
        let s = self.sizes;
        let l1 = self.ins.platform.l1_size;
        self.mode = if bytes(&[s.fmap_full, s.weight_full, s.bias_min]) <= l1 {
            L1FullLoad::Both
        } else if s.fmap_full <= s.weight_full {
            if bytes(&[s.weight_full, s.fmap_min, s.bias_min]) <= l1 {
                L1FullLoad::Weight
            } else if bytes(&[s.fmap_full, s.bias_min, s.weight_min]) <= l1 {
                L1FullLoad::Fmap
            } else {
                L1FullLoad::None
            }
        } else if bytes(&[s.fmap_full, s.bias_min]) <= l1 {
            L1FullLoad::Fmap
        } else if bytes(&[s.weight_full, s.fmap_min, s.bias_min]) <= l1 {
            L1FullLoad::Weight
        } else {
            L1FullLoad::None
        };
        match self.mode {
            L1FullLoad::Both => {
                self.pb.al1 = 1;
                self.pb.bl1 = 1;
            }
            L1FullLoad::Fmap => self.pb.al1 = 1,
            L1FullLoad::Weight => self.pb.bl1 = 1,
            L1FullLoad::None => {}
        }

        let r = &self.ranges;
        let (last_ka, last_kb) = (r.last(Axis::KA), r.last(Axis::KB));
        let (last_ma, last_nb) = (r.last(Axis::MA), r.last(Axis::NB));
        self.idx = match self.mode {
            L1FullLoad::None => L1Indices::default(),
            L1FullLoad::Fmap => L1Indices {
                k_a: last_ka,
                m_a: last_ma,
                ..L1Indices::default()
            },
            L1FullLoad::Weight => L1Indices {
                k_b: last_kb,
                n_b: last_nb,
                ..L1Indices::default()
            },
            L1FullLoad::Both => L1Indices {
                k_a: last_ka,
                k_b: last_kb,
                m_a: last_ma,
                n_b: last_nb,
            },
        };
        debug!("L1 full load: {:?}, sizes {:?}", self.mode, self.sizes);
    }

    /// Whether the current L1 indices fit in L1.
    pub(super) fn check_l1_buffer(&self) -> bool {
        let ins = self.ins;
        let s = &self.sizes;
        let fmap = match self.mode {
            L1FullLoad::Both | L1FullLoad::Fmap => s.fmap_full,
            L1FullLoad::Weight | L1FullLoad::None => {
                let cin1 = self.ranges.k_a[self.idx.k_a] / s.ci0_hk_wk;
                let area = ins.fmap_l1_area(self.ranges.m_a[self.idx.m_a]);
                cin1 * area * ins.fmap_size * self.pb.al1 * ins.cube.k0
            }
        };
        let weight = if self.bypass {
            0
        } else {
            match self.mode {
                L1FullLoad::Both | L1FullLoad::Weight => s.weight_full,
                L1FullLoad::Fmap | L1FullLoad::None => {
                    self.ranges.k_b[self.idx.k_b]
                        * self.pb.bl1
                        * self.ranges.n_b[self.idx.n_b]
                        * ins.weight_size
                }
            }
        };
        let bias = match (ins.has_bias, self.bias_full) {
            (false, _) => 0,
            (true, true) => ins.n_full() * ins.bias_size,
            (true, false) => self.n_l0 * ins.bias_size,
        };
        fmap.saturating_add(weight).saturating_add(bias) <= ins.platform.l1_size
    }

    /// Advances one index while the L1 still fits, then backs off to the
    /// last fitting value.
    fn grow(&mut self, axis: Axis) {
        let len = self.ranges.len(axis);
        while *self.idx.at_mut(axis) < len && self.check_l1_buffer() {
            *self.idx.at_mut(axis) += 1;
        }
        let idx = self.idx.at_mut(axis);
        *idx = step_back(*idx);
    }

    /// Like [Solver::grow], but restores the index and returns the result.
    fn probe(&mut self, axis: Axis) -> usize {
        let start = *self.idx.at_mut(axis);
        self.grow(axis);
        std::mem::replace(self.idx.at_mut(axis), start)
    }

    pub(super) fn core_l1_decision(&mut self) -> Result<(), TilingError> {
        match self.mode {
            L1FullLoad::Both => {
                self.order = IterateOrder::MFirst;
            }
            L1FullLoad::Fmap => {
                self.order = IterateOrder::NFirst;
                let s = self.sizes;
                if bytes(&[s.fmap_full, s.weight_min, s.bias_min]) > self.ins.platform.l1_size {
                    self.bypass = true;
                    return Ok(());
                }
                self.grow(Axis::KB);
                if self.idx.k_b == self.ranges.last(Axis::KB) {
                    self.grow(Axis::NB);
                }
            }
            L1FullLoad::Weight => {
                self.order = IterateOrder::MFirst;
                self.grow(Axis::KA);
                if self.idx.k_a == self.ranges.last(Axis::KA) {
                    self.grow(Axis::MA);
                }
            }
            L1FullLoad::None => self.no_full_load_decision()?,
        }
        Ok(())
    }

    /// Fmap K held whole: walk N first, growing weight K then fmap M.
    fn full_k_a_iter(&mut self) {
        self.idx.k_a = self.ranges.last(Axis::KA);
        self.order = IterateOrder::NFirst;
        self.grow(Axis::KB);
        self.grow(Axis::MA);
    }

    /// Weight K held whole: walk M first, growing fmap K then weight N.
    fn full_k_b_iter(&mut self) {
        self.idx.k_b = self.ranges.last(Axis::KB);
        self.order = IterateOrder::MFirst;
        self.grow(Axis::KA);
        self.grow(Axis::NB);
    }

    /// Estimated bytes moved from global memory by the two iteration
    /// orders: weight reloaded per M tile with the fmap loaded once per
    /// output depth, against fmap reloaded per N tile with the weight
    /// loaded once.
    fn reload_costs(&self, m_loops: u64, n_loops: u64) -> Result<(u64, u64), TilingError> {
        let s = &self.sizes;
        let d = self.ins.single_do;
        let too_big = || {
            TilingError::L1TilingInfeasible("global memory traffic estimate overflows u64".to_string())
        };
        let n_first = checked_product(&[s.weight_full, d, m_loops])
            .and_then(|w| w.checked_add(s.fmap_full.checked_mul(d)?))
            .ok_or_else(too_big)?;
        let m_first = checked_product(&[s.fmap_full, d, n_loops])
            .and_then(|f| f.checked_add(s.weight_full))
            .ok_or_else(too_big)?;
        Ok((n_first, m_first))
    }

    fn no_full_load_decision(&mut self) -> Result<(), TilingError> {
        let ins = self.ins;
        let s = self.sizes;
        let l1 = ins.platform.l1_size;
        let (k_a_whole, k_b_whole, k_ab_whole) =
            if bytes(&[s.fmap_k_full, s.weight_k_full, s.bias_min]) <= l1 {
                (true, true, true)
            } else {
                (
                    bytes(&[s.fmap_k_full, s.weight_min, s.bias_min]) <= l1,
                    bytes(&[s.fmap_min, s.weight_k_full, s.bias_min]) <= l1,
                    false,
                )
            };
        debug!("L1 whole-K: fmap={k_a_whole} weight={k_b_whole} both={k_ab_whole}");

        match (k_a_whole, k_b_whole, k_ab_whole) {
            (true, false, _) => self.full_k_a_iter(),
            (false, true, _) => self.full_k_b_iter(),
            (true, true, false) => {
                let m_loops = ceil_div(ins.single_m, self.m_l0);
                let n_loops = ceil_div(ins.single_co, self.n_l0);
                let (n_first, m_first) = self.reload_costs(m_loops, n_loops)?;
                if n_first < m_first {
                    self.full_k_a_iter();
                } else {
                    self.full_k_b_iter();
                }
            }
            (true, true, true) => {
                self.idx.k_a = self.ranges.last(Axis::KA);
                self.idx.k_b = self.ranges.last(Axis::KB);
                let m_idx = self.probe(Axis::MA);
                let n_idx = self.probe(Axis::NB);
                let m_loops = ceil_div(ins.single_m, self.ranges.m_a[m_idx]);
                let n_loops = ceil_div(ins.single_co, self.ranges.n_b[n_idx]);
                let (n_first, m_first) = self.reload_costs(m_loops, n_loops)?;
                if n_first < m_first {
                    self.order = IterateOrder::NFirst;
                    self.idx.m_a = m_idx;
                } else {
                    self.order = IterateOrder::MFirst;
                    self.idx.n_b = n_idx;
                }
            }
            (false, false, _) => {
                self.order = IterateOrder::MFirst;
                if bytes(&[s.fmap_min, s.weight_min, s.bias_min]) > l1 {
                    self.bypass = true;
                    return Ok(());
                }
                let len = self.ranges.len(Axis::KA);
                while self.idx.k_a < len && self.check_l1_buffer() {
                    self.idx.k_a += 1;
                    self.idx.k_b += 1;
                }
                self.idx.k_a = step_back(self.idx.k_a);
                self.idx.k_b = step_back(self.idx.k_b);
            }
        }
        Ok(())
    }

    /// Holds the whole bias in L1 if it still fits.
    pub(super) fn bias_l1_decision(&mut self) {
        if !self.ins.has_bias || self.bias_full {
            return;
        }
        self.bias_full = true;
        if !self.check_l1_buffer() {
            self.bias_full = false;
        }
    }

    /// The weight goes straight to L0B when one L1 weight tile is exactly
    /// one L0B tile. The L1 space it frees goes to the fmap: the largest
    /// fitting fmap K that is a multiple of kL0, then M.
    pub(super) fn weight_bypass_decision(&mut self) {
        if !self.bypass
            && self.ranges.k_b[self.idx.k_b] == self.k_l0
            && self.ranges.n_b[self.idx.n_b] == self.n_l0
        {
            self.bypass = true;
        }
        if !self.bypass {
            return;
        }
        self.pb.bl1 = 1;

        let start = self.idx.k_a;
        let last = self.ranges.last(Axis::KA);
        let found = (start..=last).rev().find(|&i| {
            self.idx.k_a = i;
            self.ranges.k_a[i] % self.k_l0 == 0 && self.check_l1_buffer()
        });
        self.idx.k_a = found.unwrap_or(start);
        if self.idx.k_a == last {
            self.grow(Axis::MA);
        }
        self.bias_l1_decision();
    }

    pub(super) fn l1_decision(&self) -> L1Decision {
        let ins = self.ins;
        let align = self.sizes.align_cin_kh_kw_kd;
        let tail = |k: u64| match align % k {
            0 => k,
            rem => rem,
        };
        let k_al1 = self.ranges.k_a[self.idx.k_a];
        let k_bl1 = self.ranges.k_b[self.idx.k_b];
        let mut d = L1Decision {
            k_al1,
            k_al1_tail: tail(k_al1),
            k_bl1,
            k_bl1_tail: tail(k_bl1),
            m_al1: self.ranges.m_a[self.idx.m_a],
            n_bl1: self.ranges.n_b[self.idx.n_b],
            al1_full_load: false,
            bl1_full_load: false,
        };
        if matches!(self.mode, L1FullLoad::Weight | L1FullLoad::Both) {
            d.n_bl1 = ins.n_full();
            d.bl1_full_load = true;
        }
        if matches!(self.mode, L1FullLoad::Fmap | L1FullLoad::Both) {
            d.m_al1 = ins.m_full();
            d.al1_full_load = true;
        }
        if self.bypass {
            d.k_bl1 = 0;
            d.n_bl1 = 0;
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Dtype, Format};
    use crate::tiling::check::resolve;
    use crate::tiling::tests::test_platform;
    use crate::tiling::Conv3dTiling;
    use crate::tilingdata::ApiTiling;

    fn fp16_conv(ci: i64, di: i64, hw: i64, co: i64, k: i64) -> Conv3dTiling {
        let out = hw - k + 1;
        let mut tiling = Conv3dTiling::new(test_platform());
        tiling
            .set_org_fmap_shape(ci, di, hw, hw)
            .set_org_weight_shape(co, k, k, k)
            .set_single_weight_shape(ci, k, k, k)
            .set_single_output_shape(co, di - k + 1, out * out)
            .set_groups(1)
            .set_fmap_type(Format::Ndc1hwc0, Dtype::Float16)
            .set_weight_type(Format::FractalZ3d, Dtype::Float16)
            .set_output_type(Format::Ndc1hwc0, Dtype::Float16);
        tiling
    }

    #[test]
    fn test_small_conv_holds_everything() {
        let tiling = fp16_conv(16, 4, 8, 16, 3);
        let t = tiling.get_tiling().unwrap();
        assert!(t.al1_full_load && t.bl1_full_load);
        assert_eq!(t.iterate_mn_order, IterateOrder::MFirst);
        assert_eq!((t.m_l0, t.n_l0, t.k_l0), (48, 16, 432));
        assert_eq!(t.m_al1, 48);
        assert!(t.bl1_bypass_flag);
        assert_eq!((t.k_bl1, t.n_bl1), (0, 0));
        assert_eq!(t.k_al1, 432);
        assert_eq!(t.cin1_in_al1, 3);
        // Only L0C is double-buffered.
        assert_eq!(t.p_buffer_flag, 0b000100);
    }

    #[test]
    fn test_large_weight_holds_fmap() {
        let tiling = fp16_conv(256, 3, 4, 2048, 3);
        let t = tiling.get_tiling().unwrap();
        assert!(t.al1_full_load);
        assert!(!t.bl1_full_load);
        assert!(!t.bl1_bypass_flag);
        assert_eq!(t.iterate_mn_order, IterateOrder::NFirst);
        assert_eq!((t.m_l0, t.n_l0), (16, 16));
        assert_eq!((t.k_al1, t.k_bl1, t.n_bl1), (6912, 6912, 16));
        assert_eq!(t.k_l0, 864);
        assert_eq!(t.k_bl1_div_k0, 432);
    }

    #[test]
    fn test_large_fmap_holds_weight() {
        let tiling = fp16_conv(16, 1, 256, 16, 1);
        let t = tiling.get_tiling().unwrap();
        assert!(t.bl1_full_load);
        assert!(!t.al1_full_load);
        assert_eq!(t.iterate_mn_order, IterateOrder::MFirst);
        assert_eq!((t.m_l0, t.n_l0, t.k_l0), (1024, 16, 16));
        assert_eq!(t.m_al1, 4096);
        assert_eq!(t.m_al1_div_m_l0, 4);
        assert!(t.bl1_bypass_flag);
    }

    fn l1_bytes(t: &ApiTiling) -> u64 {
        let k0 = 16;
        let wo = t.org_wo;
        let hi_rows = ((t.m_al1 / wo + 2 - 1) * t.stride_h + (t.kernel_h - 1) * t.dilation_h + 1).min(t.org_hi);
        let fmap = (t.k_al1 / (t.kernel_h * t.kernel_w * k0)) * hi_rows * t.org_wi * k0 * 2;
        let weight = t.k_bl1 * t.n_bl1 * 2;
        fmap + weight
    }

    #[test]
    fn test_neither_operand_whole() {
        let tiling = fp16_conv(512, 16, 64, 512, 3);
        let t = tiling.get_tiling().unwrap();
        assert!(!t.al1_full_load && !t.bl1_full_load);
        assert!(l1_bytes(&t) <= test_platform().l1_size);
        assert_eq!(t.k_al1 % (3 * 3 * 16), 0);
        assert_eq!(t.k_al1 % t.k_l0, 0);
    }

    #[test]
    fn test_mode_selection_sets_single_buffers() {
        let tiling = fp16_conv(16, 4, 8, 16, 3);
        let inputs = resolve(&tiling).unwrap();
        let mut solver = Solver::new(&inputs);
        solver.init_ping_pong();
        solver.l0_tiling_range().unwrap();
        solver.l0_tiling_decision();
        solver.check_l0c_double_buffer();
        solver.init_l1_sizes().unwrap();
        solver.l1_tiling_range().unwrap();
        assert_eq!(solver.ranges.k_a, vec![144, 288, 432]);
        assert_eq!(solver.ranges.n_b, vec![16]);
        solver.init_l1_mode();
        assert_eq!(solver.mode, L1FullLoad::Both);
        assert_eq!((solver.pb.al1, solver.pb.bl1), (1, 1));
        assert_eq!(solver.idx.k_a, 2);
        assert!(solver.check_l1_buffer());
    }
}
