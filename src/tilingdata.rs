//! The records handed to the kernel launcher.

use crate::common::{IterateOrder, OutputOrder, QuantType, ScaleBiasLoad};
use crate::error::TilingError;
use crate::shape::{Pads, Spatial};
use serde::{Deserialize, Serialize};

/// Whole-operator dimensions and the per-axis core split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct RunInfo {
    pub batch: u64,
    pub cin: u64,
    pub din: u64,
    pub hin: u64,
    pub win: u64,
    pub cout: u64,
    pub kd: u64,
    pub kh: u64,
    pub kw: u64,
    pub dout: u64,
    pub hout: u64,
    pub wout: u64,
    pub batch_dim: u64,
    pub m_dim: u64,
    pub n_dim: u64,
    pub do_dim: u64,
    pub group_dim: u64,
    pub stride_h: u64,
    pub stride_w: u64,
    pub stride_d: u64,
    pub dilation_h: u64,
    pub dilation_w: u64,
    pub dilation_d: u64,
    pub pad_head: u64,
    pub pad_tail: u64,
    pub pad_top: u64,
    pub pad_bottom: u64,
    pub pad_left: u64,
    pub pad_right: u64,
    pub has_bias: bool,
}

/// Per-core buffer tiling.
///
/// `single_core_m` holds the flattened output extent in M mode and the
/// output height in HW mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct ApiTiling {
    pub groups: u64,
    pub group_opt: u64,
    pub org_do: u64,
    pub org_co: u64,
    pub cout_opt: u64,
    pub org_ho: u64,
    pub org_wo: u64,
    pub org_ci: u64,
    pub cin_opt: u64,
    pub org_di: u64,
    pub org_hi: u64,
    pub org_wi: u64,
    pub kernel_d: u64,
    pub kernel_h: u64,
    pub kernel_w: u64,
    pub org_hixwi: u64,
    pub org_hoxwo: u64,
    pub cin1xorihixoriwixk0: u64,
    pub orihixoriwixk0: u64,
    pub oriwixk0: u64,
    pub kernel_hxkernel_w: u64,

    pub single_core_co: u64,
    pub single_core_do: u64,
    pub single_core_m: u64,
    pub single_core_group_opt: u64,
    pub output_order: OutputOrder,

    pub stride_h: u64,
    pub stride_w: u64,
    pub stride_d: u64,
    pub dilation_h: u64,
    pub dilation_w: u64,
    pub dilation_d: u64,
    pub pad_head: u64,
    pub pad_tail: u64,
    pub pad_top: u64,
    pub pad_bottom: u64,
    pub pad_left: u64,
    pub pad_right: u64,
    pub offsetx: i64,

    pub k_al1: u64,
    pub k_bl1: u64,
    pub m_al1: u64,
    pub n_bl1: u64,
    pub m_al1_div_m_l0: u64,
    pub n_bl1_div_n_l0: u64,
    pub cin1_in_al1: u64,
    pub k_al1_tail: u64,
    pub cin1_in_al1_tail: u64,
    pub k_bl1_div_k0: u64,
    pub k_bl1_tail: u64,
    pub k_bl1_tail_div_k0: u64,
    pub iterate_mn_order: IterateOrder,
    pub bias_full_load_flag: bool,
    pub fixp_params_full_load_flag: bool,
    pub bl1_bypass_flag: bool,
    pub al1_full_load: bool,
    pub bl1_full_load: bool,

    pub m_l0: u64,
    pub k_l0: u64,
    pub n_l0: u64,
    pub n_l0xk0: u64,
    pub k_l0xorg_co_align_n0: u64,

    pub m_ub: u64,
    pub n_ub: u64,
    pub quant_type: QuantType,
    pub scale_and_bias_load_type: ScaleBiasLoad,
    /// Ping-pong flags, MSB to LSB: UB, BL1, AL1, CL0, BL0, AL0.
    pub p_buffer_flag: u8,
    pub hf32_enable: bool,
    pub hf32_trans_mode: bool,
}

/// Everything one launch needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct Conv3dTilingData {
    pub run_info: RunInfo,
    pub tiling: ApiTiling,
}

impl RunInfo {
    pub fn set_strides(&mut self, strides: Spatial) {
        self.stride_d = strides.d as u64;
        self.stride_h = strides.h as u64;
        self.stride_w = strides.w as u64;
    }

    pub fn set_dilations(&mut self, dilations: Spatial) {
        self.dilation_d = dilations.d as u64;
        self.dilation_h = dilations.h as u64;
        self.dilation_w = dilations.w as u64;
    }

    pub fn set_pads(&mut self, pads: Pads) {
        [
            self.pad_head,
            self.pad_tail,
            self.pad_top,
            self.pad_bottom,
            self.pad_left,
            self.pad_right,
        ] = pads.as_array().map(|p| p as u64);
    }

    pub fn core_count(&self) -> u64 {
        self.batch_dim * self.m_dim * self.n_dim * self.do_dim * self.group_dim
    }
}

impl Conv3dTilingData {
    /// Serializes the record into the opaque blob handed to the launcher.
    pub fn to_payload(&self) -> Result<Vec<u8>, TilingError> {
        bincode::serialize(self)
            .map_err(|e| TilingError::Payload(format!("encoding failed: {e}")))
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, TilingError> {
        bincode::deserialize(bytes)
            .map_err(|e| TilingError::Payload(format!("malformed: {e}")))
    }
}
