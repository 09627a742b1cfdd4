//! UB tiling for the quantized vector stage.

use super::algorithm::Solver;
use crate::common::{QuantType, ScaleBiasLoad};
use crate::utils::ceil_div;
use log::warn;

/// UB bytes per element of the fp32 partial sums copied out of L0C.
const UB_ACC_SIZE: u64 = 4;

impl Solver<'_> {
    pub(super) fn vec_tiling(&mut self) {
        let ins = self.ins;
        if ins.quant == QuantType::Disable {
            return;
        }
        let max_load = ins.caps.quant_vec_max_load;
        let sb_size = ins.scale_size + ins.bias_size;
        let load = if sb_size * ins.single_co <= max_load {
            ScaleBiasLoad::SingleCo
        } else if sb_size * self.n_l0 <= max_load {
            ScaleBiasLoad::NL0
        } else {
            ScaleBiasLoad::NUb
        };
        self.scale_bias_load = load;
        let half_bias = ins.bias_dtype.is_some_and(|b| b.is_half());

        for m_parts in 1..=self.m_l0 {
            for n_parts in 1..=self.n_l0 / ins.cube.n0 {
                let m_ub = ceil_div(self.m_l0, m_parts);
                let n_ub = ceil_div(self.n_l0, n_parts);
                let load_len = match load {
                    ScaleBiasLoad::SingleCo => ins.single_co,
                    ScaleBiasLoad::NL0 => self.n_l0,
                    ScaleBiasLoad::NUb => n_ub,
                };
                let mut used = (UB_ACC_SIZE + ins.output_size) * m_ub * n_ub + sb_size * load_len;
                if half_bias {
                    // Half biases are widened to fp32 in UB.
                    used += UB_ACC_SIZE * load_len;
                }
                if used <= ins.platform.ub_size {
                    self.m_ub = m_ub;
                    self.n_ub = n_ub;
                    return;
                }
            }
        }
        warn!(
            "no UB tile fits {} bytes for mL0={} nL0={}; leaving mUB and nUB unset",
            ins.platform.ub_size, self.m_l0, self.n_l0
        );
    }
}
