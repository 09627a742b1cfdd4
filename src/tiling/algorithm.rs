//! Drives the buffer search and turns its state into an [ApiTiling].

use super::check::TilingInputs;
use crate::common::{IterateOrder, OutputOrder, ScaleBiasLoad};
use crate::error::{fail, TilingError};
use crate::tilingdata::ApiTiling;
use crate::utils::{align_up, ceil_div, infer_hi_l1, infer_wi_l1};
use log::debug;

pub(super) const DOUBLE_BUFFER: u64 = 2;

/// Ping-pong (double-buffer) depth per buffer; each is 1 or 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PingPong {
    pub al1: u64,
    pub bl1: u64,
    pub al0: u64,
    pub bl0: u64,
    pub cl0: u64,
    pub ub: u64,
}

/// Which operands are held whole in L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum L1FullLoad {
    None,
    Fmap,
    Weight,
    Both,
}

/// Byte sizes that steer the L1 search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) struct L1Sizes {
    /// `kh * kw * k0`: K elements per cin1 slice of one depth tap.
    pub ci0_hk_wk: u64,
    pub align_cin_kh_kw_kd: u64,
    pub fmap_full: u64,
    pub fmap_min: u64,
    pub fmap_k_full: u64,
    pub weight_full: u64,
    pub weight_min: u64,
    pub weight_k_full: u64,
    pub bias_min: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) struct L1Indices {
    pub k_a: usize,
    pub k_b: usize,
    pub m_a: usize,
    pub n_b: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(super) struct L1Ranges {
    pub k_a: Vec<u64>,
    pub k_b: Vec<u64>,
    pub m_a: Vec<u64>,
    pub n_b: Vec<u64>,
}

/// Mutable search state. Each phase reads the decisions of the earlier ones.
#[derive(Debug, Clone)]
pub(crate) struct Solver<'a> {
    pub(super) ins: &'a TilingInputs,
    pub(super) pb: PingPong,

    pub(super) m_l0_range: Vec<u64>,
    pub(super) n_l0_range: Vec<u64>,
    pub(super) k_l0_range: Vec<u64>,
    pub(super) m_l0_idx: usize,
    pub(super) n_l0_idx: usize,
    pub(super) k_l0_idx: usize,
    pub(super) m_l0: u64,
    pub(super) n_l0: u64,
    pub(super) k_l0: u64,

    pub(super) sizes: L1Sizes,
    pub(super) ranges: L1Ranges,
    pub(super) idx: L1Indices,
    pub(super) mode: L1FullLoad,
    pub(super) bypass: bool,
    pub(super) bias_full: bool,
    pub(super) order: IterateOrder,

    pub(super) m_ub: u64,
    pub(super) n_ub: u64,
    pub(super) scale_bias_load: ScaleBiasLoad,
}

/// Final L1 values, after full-load and bypass overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct L1Decision {
    pub k_al1: u64,
    pub k_al1_tail: u64,
    pub k_bl1: u64,
    pub k_bl1_tail: u64,
    pub m_al1: u64,
    pub n_bl1: u64,
    pub al1_full_load: bool,
    pub bl1_full_load: bool,
}

/// Everything the search decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Decision {
    pub pb: PingPong,
    pub m_l0: u64,
    pub n_l0: u64,
    pub k_l0: u64,
    pub l1: L1Decision,
    pub ci0_hk_wk: u64,
    pub order: IterateOrder,
    pub bias_full: bool,
    pub bypass: bool,
    pub m_ub: u64,
    pub n_ub: u64,
    pub scale_bias_load: ScaleBiasLoad,
}

impl TilingInputs {
    pub(super) fn hi_l1(&self, ho_rows: u64) -> u64 {
        infer_hi_l1(
            ho_rows,
            self.org_hi,
            self.kh,
            self.dilations.h as u64,
            self.strides.h as u64,
        )
    }

    /// Input rows times input columns that must sit in L1 to produce `m`
    /// output positions.
    ///
    /// Flattened positions may straddle row boundaries, so M order reserves
    /// two extra output rows. HW order produces whole rows, except that a
    /// tile shorter than one row only needs its columns.
    pub(super) fn fmap_l1_area(&self, m: u64) -> u64 {
        match self.order {
            OutputOrder::M => self.hi_l1(m / self.org_wo + 2) * self.org_wi,
            OutputOrder::Hw => {
                let rows = ceil_div(m, self.org_wo).max(1);
                let cols = if rows == 1 {
                    infer_wi_l1(
                        m.min(self.org_wo),
                        self.org_wi,
                        self.kw,
                        self.dilations.w as u64,
                        self.strides.w as u64,
                    )
                } else {
                    self.org_wi
                };
                self.hi_l1(rows) * cols
            }
        }
    }

    pub(super) fn m_full(&self) -> u64 {
        self.single_m1 * self.cube.m0
    }

    pub(super) fn n_full(&self) -> u64 {
        self.single_co1 * self.cube.n0
    }
}

impl PingPong {
    /// Packs the depths into one byte, MSB to LSB: UB, BL1, AL1, CL0, BL0,
    /// AL0. A bit is set when that buffer is double-buffered.
    pub fn flag(&self) -> u8 {
        [self.ub, self.bl1, self.al1, self.cl0, self.bl0, self.al0]
            .iter()
            .fold(0u8, |acc, &pb| (acc << 1) | u8::from(pb == DOUBLE_BUFFER))
    }
}

/// Decrements `idx` unless it is already 0. Used after a grow loop, which
/// stops one past the last index that passed.
pub(super) fn step_back(idx: usize) -> usize {
    idx.saturating_sub(1)
}

impl<'a> Solver<'a> {
    pub fn new(ins: &'a TilingInputs) -> Self {
        Solver {
            ins,
            pb: PingPong {
                al1: DOUBLE_BUFFER,
                bl1: DOUBLE_BUFFER,
                al0: DOUBLE_BUFFER,
                bl0: DOUBLE_BUFFER,
                cl0: 1,
                ub: 1,
            },
            m_l0_range: Vec::new(),
            n_l0_range: Vec::new(),
            k_l0_range: Vec::new(),
            m_l0_idx: 0,
            n_l0_idx: 0,
            k_l0_idx: 0,
            m_l0: 0,
            n_l0: 0,
            k_l0: 0,
            sizes: L1Sizes::default(),
            ranges: L1Ranges::default(),
            idx: L1Indices::default(),
            mode: L1FullLoad::None,
            bypass: false,
            bias_full: false,
            order: IterateOrder::MFirst,
            m_ub: 0,
            n_ub: 0,
            scale_bias_load: ScaleBiasLoad::SingleCo,
        }
    }

    pub fn run(mut self) -> Result<Decision, TilingError> {
        self.init_ping_pong();
        self.l0_tiling_range()?;
        self.l0_tiling_decision();
        self.check_l0c_double_buffer();

        self.init_l1_sizes()?;
        self.l1_tiling_range()?;
        self.init_l1_mode();
        self.core_l1_decision()?;
        self.bias_l1_decision();
        self.k_l0_decision();
        self.weight_bypass_decision();
        let l1 = self.l1_decision();

        if !self.check_l0_buffer(self.m_l0, self.k_l0, self.n_l0) {
            return fail(TilingError::L0TilingInfeasible(format!(
                "mL0={} kL0={} nL0={} exceed L0 buffers",
                self.m_l0, self.k_l0, self.n_l0
            )));
        }
        if !self.check_l1_buffer() {
            return fail(TilingError::L1TilingInfeasible(format!(
                "kAL1={} mAL1={} kBL1={} nBL1={} exceed L1 ({} bytes)",
                l1.k_al1, l1.m_al1, l1.k_bl1, l1.n_bl1, self.ins.platform.l1_size
            )));
        }

        self.vec_tiling();
        debug!(
            "buffer tiling: mL0={} kL0={} nL0={} kAL1={} kBL1={} mAL1={} nBL1={} bypass={} pBufferFlag={:#08b}",
            self.m_l0,
            self.k_l0,
            self.n_l0,
            l1.k_al1,
            l1.k_bl1,
            l1.m_al1,
            l1.n_bl1,
            self.bypass,
            self.pb.flag()
        );
        Ok(Decision {
            pb: self.pb,
            m_l0: self.m_l0,
            n_l0: self.n_l0,
            k_l0: self.k_l0,
            l1,
            ci0_hk_wk: self.sizes.ci0_hk_wk,
            order: self.order,
            bias_full: self.bias_full,
            bypass: self.bypass,
            m_ub: self.m_ub,
            n_ub: self.n_ub,
            scale_bias_load: self.scale_bias_load,
        })
    }
}

impl Decision {
    pub fn into_api_tiling(self, ins: &TilingInputs) -> ApiTiling {
        let k0 = ins.cube.k0;
        let org_co_align_n0 = align_up(ins.org_co, ins.cube.n0);
        let l1 = self.l1;
        ApiTiling {
            groups: ins.groups,
            group_opt: ins.group_opt,
            org_do: ins.org_do,
            org_co: ins.org_co,
            cout_opt: ins.cout_opt,
            org_ho: ins.org_ho,
            org_wo: ins.org_wo,
            org_ci: ins.org_ci,
            cin_opt: ins.cin_opt,
            org_di: ins.org_di,
            org_hi: ins.org_hi,
            org_wi: ins.org_wi,
            kernel_d: ins.kd,
            kernel_h: ins.kh,
            kernel_w: ins.kw,
            org_hixwi: ins.org_hi * ins.org_wi,
            org_hoxwo: ins.org_ho * ins.org_wo,
            cin1xorihixoriwixk0: ins.single_ci1 * ins.org_hi * ins.org_wi * k0,
            orihixoriwixk0: ins.org_hi * ins.org_wi * k0,
            oriwixk0: ins.org_wi * k0,
            kernel_hxkernel_w: ins.kh * ins.kw,

            single_core_co: ins.single_co,
            single_core_do: ins.single_do,
            single_core_m: match ins.order {
                OutputOrder::M => ins.single_m,
                OutputOrder::Hw => ins.single_ho,
            },
            single_core_group_opt: ins.single_core_group_opt,
            output_order: ins.order,

            stride_h: ins.strides.h as u64,
            stride_w: ins.strides.w as u64,
            stride_d: ins.strides.d as u64,
            dilation_h: ins.dilations.h as u64,
            dilation_w: ins.dilations.w as u64,
            dilation_d: ins.dilations.d as u64,
            pad_head: ins.pads.head as u64,
            pad_tail: ins.pads.tail as u64,
            pad_top: ins.pads.top as u64,
            pad_bottom: ins.pads.bottom as u64,
            pad_left: ins.pads.left as u64,
            pad_right: ins.pads.right as u64,
            offsetx: 0,

            k_al1: l1.k_al1,
            k_bl1: l1.k_bl1,
            m_al1: l1.m_al1,
            n_bl1: l1.n_bl1,
            m_al1_div_m_l0: ceil_div(l1.m_al1, self.m_l0),
            n_bl1_div_n_l0: ceil_div(l1.n_bl1, self.n_l0),
            cin1_in_al1: l1.k_al1 / self.ci0_hk_wk,
            k_al1_tail: l1.k_al1_tail,
            cin1_in_al1_tail: l1.k_al1_tail / self.ci0_hk_wk,
            k_bl1_div_k0: l1.k_bl1 / k0,
            k_bl1_tail: l1.k_bl1_tail,
            k_bl1_tail_div_k0: l1.k_bl1_tail / k0,
            iterate_mn_order: self.order,
            bias_full_load_flag: self.bias_full,
            fixp_params_full_load_flag: false,
            bl1_bypass_flag: self.bypass,
            al1_full_load: l1.al1_full_load,
            bl1_full_load: l1.bl1_full_load,

            m_l0: self.m_l0,
            k_l0: self.k_l0,
            n_l0: self.n_l0,
            n_l0xk0: self.n_l0 * k0,
            k_l0xorg_co_align_n0: self.k_l0 * org_co_align_n0,

            m_ub: self.m_ub,
            n_ub: self.n_ub,
            quant_type: ins.quant,
            scale_and_bias_load_type: self.scale_bias_load,
            p_buffer_flag: self.pb.flag(),
            hf32_enable: ins.hf32_enable,
            hf32_trans_mode: false,
        }
    }
}
