//! L0A/L0B/L0C tile selection.

use super::algorithm::{step_back, Solver, DOUBLE_BUFFER};
use crate::error::{fail, TilingError};
use crate::utils::{ceil_div, comm_factors_with_powers_of_two, factors, gcd};

/// Starting K extent for the M/N search, before K is decided.
const INITIAL_K_L0: u64 = 16;

impl Solver<'_> {
    pub(super) fn init_ping_pong(&mut self) {
        let cube = self.ins.cube;
        self.pb.al1 = DOUBLE_BUFFER;
        self.pb.al1 = if self.l1_size_for_l0(cube.m0, cube.n0) <= self.ins.platform.l1_size {
            DOUBLE_BUFFER
        } else {
            1
        };
        self.pb.bl1 = DOUBLE_BUFFER;
        self.pb.al0 = DOUBLE_BUFFER;
        self.pb.bl0 = DOUBLE_BUFFER;
        self.pb.cl0 = 1;
        self.pb.ub = 1;
    }

    /// L1 bytes needed to feed an `m` by `n` L0 tile: one fmap slice of
    /// depth `k0` plus the bias slice.
    fn l1_size_for_l0(&self, m: u64, n: u64) -> u64 {
        let ins = self.ins;
        let fmap = ins.fmap_l1_area(m) * ins.cube.k0 * ins.fmap_size * self.pb.al1;
        if ins.has_bias {
            fmap + n * ins.bias_size
        } else {
            fmap
        }
    }

    fn bt_size(&self, n: u64) -> u64 {
        if self.ins.has_bias {
            n * self.ins.bias_size
        } else {
            0
        }
    }

    pub(super) fn check_l0_buffer(&self, m: u64, k: u64, n: u64) -> bool {
        let ins = self.ins;
        let l0a = m * k * self.pb.al0 * ins.fmap_size;
        let l0b = k * n * self.pb.bl0 * ins.weight_size;
        let l0c = m * n * self.pb.cl0 * ins.cube.mad_size();
        l0a <= ins.platform.l0a_size && l0b <= ins.platform.l0b_size && l0c <= ins.platform.l0c_size
    }

    pub(super) fn l0_tiling_range(&mut self) -> Result<(), TilingError> {
        let ins = self.ins;
        let cube = ins.cube;
        let mad = cube.mad_size();
        let n_l0_max = (ins.platform.l0b_size / (cube.k0 * self.pb.bl0 * ins.weight_size))
            .min(ins.platform.l0c_size / (cube.m0 * self.pb.cl0 * mad));
        self.n_l0_range = comm_factors_with_powers_of_two(ins.single_co1, n_l0_max / cube.n0)
            .into_iter()
            .map(|v| v * cube.n0)
            .collect();

        let m_l0_max = (ins.platform.l0a_size / (cube.k0 * self.pb.al0 * ins.fmap_size))
            .min(ins.platform.l0c_size / (cube.n0 * self.pb.cl0 * mad));
        self.m_l0_range = comm_factors_with_powers_of_two(ins.single_m1, m_l0_max / cube.m0)
            .into_iter()
            .map(|v| v * cube.m0)
            .collect();

        if self.m_l0_range.is_empty() || self.n_l0_range.is_empty() {
            return fail(TilingError::L0TilingInfeasible(format!(
                "no m0/n0-aligned L0 tile fits (mL0 <= {m_l0_max}, nL0 <= {n_l0_max})"
            )));
        }
        Ok(())
    }

    /// Grows M and N alternately, favoring the smaller one and M once N is
    /// exhausted, until L0, L1, or BT overflows; then backs off one step on
    /// the axis that grew last.
    pub(super) fn l0_tiling_decision(&mut self) {
        let (m_len, n_len) = (self.m_l0_range.len(), self.n_l0_range.len());
        self.m_l0_idx = 0;
        self.n_l0_idx = 0;
        self.m_l0 = self.m_l0_range[0];
        self.n_l0 = self.n_l0_range[0];

        let mut update_m = false;
        while self.l0_tile_fits() {
            update_m = self.m_l0 <= self.n_l0 || self.n_l0_idx == n_len - 1;
            if update_m {
                self.m_l0_idx += 1;
            } else {
                self.n_l0_idx += 1;
            }
            if self.m_l0_idx >= m_len || self.n_l0_idx >= n_len {
                break;
            }
            self.m_l0 = self.m_l0_range[self.m_l0_idx];
            self.n_l0 = self.n_l0_range[self.n_l0_idx];
        }
        if update_m {
            self.m_l0_idx = step_back(self.m_l0_idx);
        } else {
            self.n_l0_idx = step_back(self.n_l0_idx);
        }
        self.m_l0 = self.m_l0_range[self.m_l0_idx];
        self.n_l0 = self.n_l0_range[self.n_l0_idx];
    }

    fn l0_tile_fits(&self) -> bool {
        let platform = &self.ins.platform;
        self.check_l0_buffer(self.m_l0, INITIAL_K_L0, self.n_l0)
            && self.l1_size_for_l0(self.m_l0, self.n_l0) <= platform.l1_size
            && self.bt_size(self.n_l0) <= platform.bt_size
    }

    pub(super) fn check_l0c_double_buffer(&mut self) {
        let l0c = self.m_l0 * self.n_l0 * self.pb.cl0 * self.ins.cube.mad_size();
        if l0c <= self.ins.platform.l0c_size / DOUBLE_BUFFER {
            self.pb.cl0 = DOUBLE_BUFFER;
        }
    }

    /// Turns off L0A and/or L0B double buffering when the whole K extent
    /// fits in L0 and the matching M or N tile is already whole. Returns
    /// whether K was settled this way.
    fn fix_l0_ping_pong(&mut self) -> bool {
        let ins = self.ins;
        let Some(&k_max) = self.k_l0_range.last() else {
            return false;
        };
        let k_full = ins.kd * ins.single_ci1 * self.sizes.ci0_hk_wk;
        let l0a_no_db = k_max * self.m_l0 * ins.fmap_size;
        let l0b_no_db = k_max * self.n_l0 * ins.weight_size;
        if k_max != k_full
            || l0a_no_db > ins.platform.l0a_size
            || l0b_no_db > ins.platform.l0b_size
            || k_max >= ins.caps.max_kl0
        {
            return false;
        }
        let m_whole = self.m_l0 == ins.m_full();
        let n_whole = self.n_l0 == ins.n_full();
        if m_whole && n_whole {
            self.pb.al0 = 1;
            self.pb.bl0 = 1;
        } else if m_whole && l0b_no_db * DOUBLE_BUFFER <= ins.platform.l0b_size {
            self.pb.al0 = 1;
        } else if n_whole && l0a_no_db * DOUBLE_BUFFER <= ins.platform.l0a_size {
            self.pb.bl0 = 1;
        } else {
            return false;
        }
        self.k_l0_idx = self.k_l0_range.len() - 1;
        self.k_l0 = k_max;
        true
    }

    /// K tiles must divide both the fmap and the weight K extent held in L1.
    pub(super) fn k_l0_decision(&mut self) {
        let k0 = self.ins.cube.k0;
        let max_a = ceil_div(self.ranges.k_a[self.idx.k_a], k0);
        let max_b = if self.bypass {
            max_a
        } else {
            ceil_div(self.ranges.k_b[self.idx.k_b], k0)
        };
        self.k_l0_range = factors(gcd(max_a, max_b))
            .into_iter()
            .map(|v| v * k0)
            .collect();
        if self.fix_l0_ping_pong() {
            return;
        }

        let max_kl0 = self.ins.caps.max_kl0;
        self.k_l0_idx = 0;
        while self.k_l0_idx < self.k_l0_range.len() {
            let k = self.k_l0_range[self.k_l0_idx];
            if !self.check_l0_buffer(self.m_l0, k, self.n_l0) || k >= max_kl0 {
                break;
            }
            self.k_l0_idx += 1;
        }
        self.k_l0_idx = step_back(self.k_l0_idx);
        self.k_l0 = self.k_l0_range.get(self.k_l0_idx).copied().unwrap_or(k0);
    }
}
