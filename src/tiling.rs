//! Per-core buffer tiling.
//!
//! [Conv3dTiling] is configured with one core's share of a convolution
//! through its setters, then [Conv3dTiling::get_tiling] validates the
//! configuration and searches for L1, L0, and UB tile sizes.

mod algorithm;
mod check;
mod l0;
mod l1;
mod vec;

use crate::common::{Dtype, Format, OutputOrder, TensorDesc};
use crate::error::TilingError;
use crate::shape::{Pads, Spatial};
use crate::target::{HardwareCapabilities, PlatformInfo};
use crate::tilingdata::ApiTiling;

/// Dimensions as configured, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ApiShape {
    pub org_ci: i64,
    pub org_di: i64,
    pub org_hi: i64,
    pub org_wi: i64,
    pub org_co: i64,
    pub org_kd: i64,
    pub org_kh: i64,
    pub org_kw: i64,
    pub single_ci: i64,
    pub single_kd: i64,
    pub single_kh: i64,
    pub single_kw: i64,
    pub single_co: i64,
    pub single_do: i64,
    pub single_m: i64,
    pub single_ho: i64,
    pub single_wo: i64,
    pub cin_opt: i64,
    pub cout_opt: i64,
    pub single_core_group_opt: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ApiAttrs {
    pub groups: i64,
    pub group_opt: i64,
    pub pads: Pads,
    pub strides: Spatial,
    pub dilations: Spatial,
}

/// Builder-style description of one core's convolution.
///
/// Setters may be called in any order except [Conv3dTiling::set_groups],
/// which reads the original channel counts and so must follow
/// [Conv3dTiling::set_org_fmap_shape] and
/// [Conv3dTiling::set_org_weight_shape].
#[derive(Debug, Clone)]
pub struct Conv3dTiling {
    pub(crate) platform: PlatformInfo,
    pub(crate) caps: HardwareCapabilities,
    pub(crate) shape: ApiShape,
    pub(crate) attrs: ApiAttrs,
    pub(crate) fmap: TensorDesc,
    pub(crate) weight: TensorDesc,
    pub(crate) output: TensorDesc,
    pub(crate) bias: Option<Dtype>,
    pub(crate) scale: Option<Dtype>,
    pub(crate) hf32_enable: bool,
    pub(crate) hf32_trans_mode: bool,
    pub(crate) output_order: OutputOrder,
}

impl Default for ApiAttrs {
    fn default() -> Self {
        ApiAttrs {
            groups: 1,
            group_opt: 1,
            pads: Pads::default(),
            strides: Spatial::splat(1),
            dilations: Spatial::splat(1),
        }
    }
}

impl Conv3dTiling {
    pub fn new(platform: PlatformInfo) -> Self {
        Conv3dTiling {
            caps: platform.soc.capabilities(),
            platform,
            shape: ApiShape {
                single_core_group_opt: 1,
                ..ApiShape::default()
            },
            attrs: ApiAttrs::default(),
            fmap: TensorDesc::new(Format::Ndc1hwc0, Dtype::Float16),
            weight: TensorDesc::new(Format::FractalZ3d, Dtype::Float16),
            output: TensorDesc::new(Format::Ndc1hwc0, Dtype::Float16),
            bias: None,
            scale: None,
            hf32_enable: false,
            hf32_trans_mode: false,
            output_order: OutputOrder::M,
        }
    }

    pub fn set_org_fmap_shape(&mut self, ci: i64, di: i64, hi: i64, wi: i64) -> &mut Self {
        self.shape.org_ci = ci;
        self.shape.org_di = di;
        self.shape.org_hi = hi;
        self.shape.org_wi = wi;
        self
    }

    pub fn set_org_weight_shape(&mut self, co: i64, kd: i64, kh: i64, kw: i64) -> &mut Self {
        self.shape.org_co = co;
        self.shape.org_kd = kd;
        self.shape.org_kh = kh;
        self.shape.org_kw = kw;
        self
    }

    pub fn set_single_weight_shape(&mut self, ci: i64, kd: i64, kh: i64, kw: i64) -> &mut Self {
        self.shape.single_ci = ci;
        self.shape.single_kd = kd;
        self.shape.single_kh = kh;
        self.shape.single_kw = kw;
        self
    }

    /// One core's output share with a flattened spatial extent `m`.
    pub fn set_single_output_shape(&mut self, co: i64, dout: i64, m: i64) -> &mut Self {
        self.shape.single_co = co;
        self.shape.single_do = dout;
        self.shape.single_m = m;
        self
    }

    /// One core's output share with separate height and width; switches the
    /// output order to HW.
    pub fn set_single_output_shape_hw(&mut self, co: i64, dout: i64, ho: i64, wo: i64) -> &mut Self {
        self.shape.single_co = co;
        self.shape.single_do = dout;
        self.shape.single_ho = ho;
        self.shape.single_wo = wo;
        self.shape.single_m = ho.saturating_mul(wo);
        self.output_order = OutputOrder::Hw;
        self
    }

    pub fn set_output_order(&mut self, order: OutputOrder) -> &mut Self {
        self.output_order = order;
        self
    }

    /// Pads in head, tail, top, bottom, left, right order.
    pub fn set_padding(&mut self, pads: [i64; 6]) -> &mut Self {
        let [head, tail, top, bottom, left, right] = pads;
        self.attrs.pads = Pads {
            head,
            tail,
            top,
            bottom,
            left,
            right,
        };
        self
    }

    pub fn set_dilation(&mut self, h: i64, w: i64, d: i64) -> &mut Self {
        self.attrs.dilations = Spatial { d, h, w };
        self
    }

    pub fn set_stride(&mut self, h: i64, w: i64, d: i64) -> &mut Self {
        self.attrs.strides = Spatial { d, h, w };
        self
    }

    /// Ungrouped convolutions also reset the folded channel counts to the
    /// original ones.
    pub fn set_groups(&mut self, groups: i64) -> &mut Self {
        self.attrs.groups = groups;
        if groups == 1 {
            self.attrs.group_opt = 1;
            self.shape.cin_opt = self.shape.org_ci;
            self.shape.cout_opt = self.shape.org_co;
        }
        self
    }

    pub fn set_opt_group_info(
        &mut self,
        group_opt: i64,
        single_core_group_opt: i64,
        cin_opt: i64,
        cout_opt: i64,
    ) -> &mut Self {
        self.attrs.group_opt = group_opt;
        self.shape.single_core_group_opt = single_core_group_opt;
        self.shape.cin_opt = cin_opt;
        self.shape.cout_opt = cout_opt;
        self
    }

    pub fn set_fmap_type(&mut self, format: Format, dtype: Dtype) -> &mut Self {
        self.fmap = TensorDesc::new(format, dtype);
        self
    }

    pub fn set_weight_type(&mut self, format: Format, dtype: Dtype) -> &mut Self {
        self.weight = TensorDesc::new(format, dtype);
        self
    }

    pub fn set_output_type(&mut self, format: Format, dtype: Dtype) -> &mut Self {
        self.output = TensorDesc::new(format, dtype);
        self
    }

    pub fn set_bias_type(&mut self, dtype: Dtype) -> &mut Self {
        self.bias = Some(dtype);
        self
    }

    pub fn set_scale_type(&mut self, dtype: Dtype) -> &mut Self {
        self.scale = Some(dtype);
        self
    }

    pub fn set_hf32(&mut self, enable: bool, trans_mode: bool) -> &mut Self {
        self.hf32_enable = enable;
        self.hf32_trans_mode = trans_mode;
        self
    }

    pub fn is_point_wise(&self) -> bool {
        self.fmap.format == Format::Ncdhw
    }

    /// Validates the configuration and computes the buffer tiling. Does not
    /// mutate `self`; repeated calls return identical results.
    pub fn get_tiling(&self) -> Result<ApiTiling, TilingError> {
        let inputs = check::resolve(self)?;
        let decision = algorithm::Solver::new(&inputs).run()?;
        Ok(decision.into_api_tiling(&inputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Dtype, Format};
    use crate::error::status_code;

    pub(crate) fn test_platform() -> PlatformInfo {
        PlatformInfo {
            l1_size: 524_288,
            l0a_size: 65_536,
            l0b_size: 65_536,
            l0c_size: 131_072,
            ub_size: 262_144,
            bt_size: 1024,
            ..PlatformInfo::ascend910b()
        }
    }

    fn networks_001(co: i64) -> Conv3dTiling {
        let (ci, di, hi, wi) = (4, 120, 32, 32);
        let (kd, kh, kw) = (1, 2, 2);
        let (ho, wo, dout) = ((hi - kh) / 2 + 1, (wi - kw) / 2 + 1, di - kd + 1);
        let mut tiling = Conv3dTiling::new(test_platform());
        tiling
            .set_org_fmap_shape(ci, di, hi, wi)
            .set_org_weight_shape(co, kd, kh, kw)
            .set_single_weight_shape(ci, kd, kh, kw)
            .set_single_output_shape(co, dout, ho * wo)
            .set_padding([0; 6])
            .set_stride(2, 2, 1)
            .set_dilation(1, 1, 1)
            .set_groups(1)
            .set_opt_group_info(1, 1, ci, co)
            .set_fmap_type(Format::Ndc1hwc0, Dtype::Bf16)
            .set_weight_type(Format::FractalZ3d, Dtype::Bf16)
            .set_output_type(Format::Ndc1hwc0, Dtype::Bf16);
        tiling
    }

    fn assert_well_formed(t: &ApiTiling) {
        let (m0, n0, k0) = (16, 16, 16);
        assert_ne!(t.k_al1, 0);
        if t.bl1_bypass_flag {
            assert_eq!((t.k_bl1, t.n_bl1), (0, 0));
        } else {
            assert_ne!(t.k_bl1, 0);
            assert_ne!(t.n_bl1, 0);
            assert!(t.n_bl1 % t.n_l0 == 0 || t.n_bl1 % n0 == 0);
        }
        assert_ne!(t.m_al1, 0);
        assert!(t.m_al1 % t.m_l0 == 0 || t.m_al1 % m0 == 0);
        assert!(t.m_l0 != 0 && t.m_l0 % m0 == 0);
        assert!(t.n_l0 != 0 && t.n_l0 % n0 == 0);
        assert!(t.k_l0 != 0 && t.k_l0 % k0 == 0);
    }

    #[test]
    fn test_networks_001_tiles() {
        let tiling = networks_001(1152).get_tiling().unwrap();
        assert_well_formed(&tiling);
        assert_eq!(tiling.org_ho, 16);
        assert_eq!(tiling.org_wo, 16);
        assert_eq!(tiling.single_core_m, 256);
        assert_eq!(tiling.kernel_hxkernel_w, 4);
    }

    #[test]
    fn test_huge_cout_overflows() {
        let co = (u64::MAX / 1000) as i64;
        let result = networks_001(co).get_tiling();
        assert!(result.is_err());
        assert_eq!(status_code(&result), -1);
    }

    #[test]
    fn test_kernel_larger_than_padded_input_fails() {
        let mut tiling = Conv3dTiling::new(test_platform());
        tiling
            .set_org_fmap_shape(1, 32, 30, 20)
            .set_org_weight_shape(1, 20, 23, 23)
            .set_single_weight_shape(1, 20, 23, 23)
            .set_single_output_shape(1, 1, 16)
            .set_padding([0, 0, 1, 1, 1, 1])
            .set_stride(5, 10, 17)
            .set_dilation(1, 1, 1)
            .set_groups(1)
            .set_fmap_type(Format::Ndc1hwc0, Dtype::Bf16)
            .set_weight_type(Format::FractalZ3d, Dtype::Bf16)
            .set_output_type(Format::Ndc1hwc0, Dtype::Bf16);
        assert!(matches!(
            tiling.get_tiling(),
            Err(TilingError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_point_wise_with_fp32_bias() {
        let (ci, di, hi, wi) = (240, 32, 4, 32);
        let co = 240;
        let mut tiling = Conv3dTiling::new(test_platform());
        tiling
            .set_org_fmap_shape(ci, di, hi, wi)
            .set_org_weight_shape(co, 1, 1, 1)
            .set_single_weight_shape(ci, 1, 1, 1)
            .set_single_output_shape(co, di, hi * wi)
            .set_groups(1)
            .set_fmap_type(Format::Ncdhw, Dtype::Bf16)
            .set_weight_type(Format::Ncdhw, Dtype::Bf16)
            .set_output_type(Format::Ncdhw, Dtype::Bf16)
            .set_bias_type(Dtype::Float32);
        assert!(tiling.is_point_wise());
        let result = tiling.get_tiling().unwrap();
        assert_well_formed(&result);
        assert_eq!(result.kernel_hxkernel_w, 1);
    }

    #[test]
    fn test_point_wise_rejects_padding() {
        let mut tiling = Conv3dTiling::new(test_platform());
        tiling
            .set_org_fmap_shape(16, 4, 4, 4)
            .set_org_weight_shape(16, 1, 1, 1)
            .set_single_weight_shape(16, 1, 1, 1)
            .set_single_output_shape(16, 4, 16)
            .set_padding([0, 0, 1, 0, 0, 0])
            .set_groups(1)
            .set_fmap_type(Format::Ncdhw, Dtype::Bf16)
            .set_weight_type(Format::Ncdhw, Dtype::Bf16)
            .set_output_type(Format::Ncdhw, Dtype::Bf16);
        assert!(matches!(
            tiling.get_tiling(),
            Err(TilingError::InvalidAttr(_))
        ));
    }

    #[test]
    fn test_get_tiling_is_repeatable() {
        let tiling = networks_001(1152);
        assert_eq!(tiling.get_tiling().unwrap(), tiling.get_tiling().unwrap());
    }

    #[test]
    fn test_hf32_trans_mode_rejected() {
        let mut tiling = networks_001(64);
        tiling
            .set_fmap_type(Format::Ndc1hwc0, Dtype::Float32)
            .set_weight_type(Format::FractalZ3d, Dtype::Float32)
            .set_output_type(Format::Ndc1hwc0, Dtype::Float32)
            .set_hf32(true, true);
        assert!(tiling.get_tiling().is_err());
        tiling.set_hf32(true, false);
        let result = tiling.get_tiling().unwrap();
        assert!(result.hf32_enable);
        assert!(!result.hf32_trans_mode);
    }

    #[test]
    fn test_hw_order_reports_single_ho() {
        let mut tiling = networks_001(64);
        tiling.set_single_output_shape_hw(64, 120, 4, 16);
        let result = tiling.get_tiling().unwrap();
        assert_eq!(result.output_order, OutputOrder::Hw);
        assert_eq!(result.single_core_m, 4);
        assert_well_formed(&result);
    }
}
