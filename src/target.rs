use crate::common::Dtype;
use crate::error::{fail, TilingError};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::common::Dtype::{Bf16, Float16, Float32, Int8};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    enum_iterator::Sequence,
    clap::ValueEnum,
)]
pub enum SocVersion {
    Ascend910B,
    Ascend910_93,
}

/// On-chip buffer capacities (bytes) and core count of one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PlatformInfo {
    pub soc: SocVersion,
    pub aicore_num: u64,
    pub l1_size: u64,
    pub l0a_size: u64,
    pub l0b_size: u64,
    pub l0c_size: u64,
    pub ub_size: u64,
    pub bt_size: u64,
    /// Ratio of global-memory to L2 bandwidth used to scale block-dim costs.
    pub l2_rate: u64,
}

/// Fixed-function load3d unit limits. Only the H and W axes are limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Load3dLimits {
    pub max_stride_hw: u64,
    pub max_dilation_hw: u64,
    pub max_pad_hw: u64,
    pub max_kernel_hw: u64,
    /// Upper bound on `kh * kw * k0` moved in one load.
    pub max_ddr_to_l1: u64,
    /// Upper bound on the post-K extent of one fmap load.
    pub max_post_k: u64,
}

/// Everything that varies between chip generations, resolved once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareCapabilities {
    pub load3d: Load3dLimits,
    pub max_kl0: u64,
    pub quant_vec_max_load: u64,
    pub max_ori_one_dim: u64,
    pub max_ori_fmap_size: u64,
    pub group_opt_dtypes: &'static [Dtype],
    pub hw_mode_dtypes: &'static [Dtype],
    /// `[fmap, weight, bias, output]`
    pub with_bias: &'static [[Dtype; 4]],
    /// `[fmap, weight, output]`
    pub without_bias: &'static [[Dtype; 3]],
    /// `[fmap, weight, bias, scale, output]`
    pub with_scale: &'static [[Dtype; 5]],
    pub point_wise_with_bias: &'static [[Dtype; 4]],
    pub point_wise_without_bias: &'static [[Dtype; 3]],
}

const LOAD3D_V220: Load3dLimits = Load3dLimits {
    max_stride_hw: 63,
    max_dilation_hw: 255,
    max_pad_hw: 255,
    max_kernel_hw: 511,
    max_ddr_to_l1: 65535,
    max_post_k: 65535,
};

const V220_CAPABILITIES: HardwareCapabilities = HardwareCapabilities {
    load3d: LOAD3D_V220,
    max_kl0: 4096,
    quant_vec_max_load: 4096,
    max_ori_one_dim: 1_000_000,
    max_ori_fmap_size: i64::MAX as u64,
    group_opt_dtypes: &[Bf16, Float32, Float16, Int8],
    hw_mode_dtypes: &[Float16, Bf16, Float32, Int8],
    with_bias: &[
        [Bf16, Bf16, Float32, Bf16],
        [Float16, Float16, Float16, Float16],
        [Float32, Float32, Float32, Float32],
    ],
    without_bias: &[
        [Bf16, Bf16, Bf16],
        [Float16, Float16, Float16],
        [Float32, Float32, Float32],
        [Int8, Int8, Int8],
        [Int8, Int8, Float16],
        [Int8, Int8, Bf16],
    ],
    with_scale: &[
        [Int8, Int8, Float32, Float32, Bf16],
        [Int8, Int8, Float32, Float32, Float16],
    ],
    point_wise_with_bias: &[
        [Float16, Float16, Float32, Float16],
        [Bf16, Bf16, Float32, Bf16],
        [Float32, Float32, Float32, Float32],
    ],
    point_wise_without_bias: &[
        [Float16, Float16, Float16],
        [Bf16, Bf16, Bf16],
        [Float32, Float32, Float32],
    ],
};

impl SocVersion {
    pub fn capabilities(&self) -> HardwareCapabilities {
        match self {
            SocVersion::Ascend910B | SocVersion::Ascend910_93 => V220_CAPABILITIES,
        }
    }
}

impl Display for SocVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocVersion::Ascend910B => write!(f, "Ascend910B"),
            SocVersion::Ascend910_93 => write!(f, "Ascend910_93"),
        }
    }
}

impl PlatformInfo {
    /// The preset buffer sizes and core count of `soc`.
    pub fn new(soc: SocVersion) -> Self {
        PlatformInfo {
            soc,
            ..Self::ascend910b()
        }
    }

    pub fn ascend910b() -> Self {
        PlatformInfo {
            soc: SocVersion::Ascend910B,
            aicore_num: 24,
            l1_size: 524_288,
            l0a_size: 65_536,
            l0b_size: 65_536,
            l0c_size: 131_072,
            ub_size: 196_608,
            bt_size: 1024,
            l2_rate: 110,
        }
    }

    /// Rejects descriptors a chip query could never have produced.
    pub fn check(&self) -> Result<(), TilingError> {
        let buffers = [
            ("aicore_num", self.aicore_num),
            ("l1_size", self.l1_size),
            ("l0a_size", self.l0a_size),
            ("l0b_size", self.l0b_size),
            ("l0c_size", self.l0c_size),
            ("ub_size", self.ub_size),
            ("bt_size", self.bt_size),
        ];
        for (name, value) in buffers {
            if value == 0 {
                return fail(TilingError::PlatformUninitialized(format!("{name} is 0")));
            }
        }
        Ok(())
    }
}

impl HardwareCapabilities {
    /// Whether a dtype combination is supported by the regular (5HD) kernels.
    pub fn supports_dtypes(
        &self,
        fmap: Dtype,
        weight: Dtype,
        bias: Option<Dtype>,
        scale: Option<Dtype>,
        output: Dtype,
    ) -> bool {
        match (bias, scale) {
            (bias, Some(scale)) => {
                let combo = [fmap, weight, bias.unwrap_or(Float32), scale, output];
                self.with_scale.contains(&combo)
            }
            (Some(bias), None) => self.with_bias.contains(&[fmap, weight, bias, output]),
            (None, None) => self.without_bias.contains(&[fmap, weight, output]),
        }
    }

    /// Whether a dtype combination is supported by the point-wise kernels.
    pub fn supports_point_wise_dtypes(
        &self,
        fmap: Dtype,
        weight: Dtype,
        bias: Option<Dtype>,
        output: Dtype,
    ) -> bool {
        match bias {
            Some(bias) => self
                .point_wise_with_bias
                .contains(&[fmap, weight, bias, output]),
            None => self.point_wise_without_bias.contains(&[fmap, weight, output]),
        }
    }
}
