//! Whole-operator tiling: validation, group folding, output order, core
//! split, then one per-core [Conv3dTiling] call.

use crate::blockdim::{BlockDimProblem, BlockDimResult};
use crate::common::{Dtype, OutputOrder};
use crate::error::{fail, TilingError};
use crate::group::optimize_groups;
use crate::order::init_output_order;
use crate::shape::{ConvParams, GroupOpt, ShapeInfo};
use crate::target::{HardwareCapabilities, PlatformInfo};
use crate::tiling::Conv3dTiling;
use crate::tilingdata::{Conv3dTilingData, RunInfo};
use crate::utils::{align_up, ceil_div};
use crate::validate;
use log::{debug, warn};

/// Tiles convolutions for one chip. Holds no per-call state, so one engine
/// may serve any number of calls, including from several threads.
#[derive(Debug, Clone)]
pub struct Conv3dTilingEngine {
    platform: PlatformInfo,
    caps: HardwareCapabilities,
}

impl Conv3dTilingEngine {
    pub fn new(mut platform: PlatformInfo) -> Result<Self, TilingError> {
        platform.check()?;
        if platform.l2_rate == 0 {
            warn!("l2_rate is 0; using 1");
            platform.l2_rate = 1;
        }
        Ok(Conv3dTilingEngine {
            caps: platform.soc.capabilities(),
            platform,
        })
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    pub fn tile(&self, params: &ConvParams) -> Result<Conv3dTilingData, TilingError> {
        let shape = validate::check_all(params, &self.caps)?;
        let dtype = params.fmap.dtype;
        let Some(cube) = dtype.cube_info() else {
            return fail(TilingError::UnsupportedDtype(format!(
                "no cube unit shape for {dtype}"
            )));
        };
        let group = optimize_groups(
            params.groups,
            shape.cin as i64,
            shape.cout as i64,
            dtype,
            &self.caps,
        )?;
        debug!("group opt: {group:?}");
        if let Some((d_axis, n1_axis)) = params.weight_fractal_axes {
            validate::check_group_opt_against_weight_shape(d_axis, n1_axis, &shape, &group, &cube)?;
        }
        validate::check_weight_channels(params, &shape)?;
        validate::check_overflow(params, &shape, &group, &cube)?;

        let order = init_output_order(params, &shape, self.platform.l1_size, &self.caps)?;
        let dims = BlockDimProblem {
            shape: &shape,
            group: &group,
            cube,
            order,
            groups: params.groups as u64,
            aicore_num: self.platform.aicore_num,
            l2_rate: self.platform.l2_rate,
        }
        .decide();

        let tiling = self.core_tiling(params, &shape, &group, order, &dims);
        let api = tiling.get_tiling()?;
        Ok(Conv3dTilingData {
            run_info: run_info(params, &shape, &dims),
            tiling: api,
        })
    }

    /// Configures the per-core API with one core's share of the work.
    fn core_tiling(
        &self,
        params: &ConvParams,
        shape: &ShapeInfo,
        group: &GroupOpt,
        order: OutputOrder,
        dims: &BlockDimResult,
    ) -> Conv3dTiling {
        let n0 = params
            .fmap
            .dtype
            .cube_info()
            .map_or(1, |cube| cube.n0);
        let single_co = if dims.n_dim == 1 {
            group.cout_opt
        } else {
            ceil_div(align_up(group.cout_opt, n0), dims.n_dim)
        };
        let single_do = ceil_div(shape.dout, dims.do_dim);
        let (cin_opt, cout_opt) = (group.cin_opt as i64, group.cout_opt as i64);

        let mut tiling = Conv3dTiling::new(self.platform);
        tiling
            .set_org_weight_shape(shape.cout as i64, shape.kd as i64, shape.kh as i64, shape.kw as i64)
            .set_org_fmap_shape(shape.cin as i64, shape.di as i64, shape.hi as i64, shape.wi as i64)
            .set_single_weight_shape(cin_opt, shape.kd as i64, shape.kh as i64, shape.kw as i64)
            .set_padding(params.pads.as_array())
            .set_dilation(params.dilations.h, params.dilations.w, params.dilations.d)
            .set_stride(params.strides.h, params.strides.w, params.strides.d)
            .set_groups(params.groups)
            .set_opt_group_info(
                group.group_opt as i64,
                ceil_div(group.group_opt, dims.group_dim) as i64,
                cin_opt,
                cout_opt,
            )
            .set_fmap_type(params.fmap.format, params.fmap.dtype)
            .set_weight_type(params.weight.format, params.weight.dtype)
            .set_output_type(params.output.format, params.output.dtype)
            .set_hf32(params.hf32 && params.fmap.dtype == Dtype::Float32, false);
        match order {
            OutputOrder::M => {
                let single_m = ceil_div(shape.ho * shape.wo, dims.m_dim);
                tiling.set_single_output_shape(single_co as i64, single_do as i64, single_m as i64);
            }
            OutputOrder::Hw => {
                let single_ho = ceil_div(shape.ho, dims.m_dim);
                tiling.set_single_output_shape_hw(
                    single_co as i64,
                    single_do as i64,
                    single_ho as i64,
                    shape.wo as i64,
                );
            }
        }
        if let Some(bias) = &params.bias {
            tiling.set_bias_type(bias.desc.dtype);
        }
        if let Some(scale) = &params.scale {
            tiling.set_scale_type(scale.desc.dtype);
        }
        tiling
    }
}

fn run_info(params: &ConvParams, shape: &ShapeInfo, dims: &BlockDimResult) -> RunInfo {
    let mut info = RunInfo {
        batch: shape.batch,
        cin: shape.cin,
        din: shape.di,
        hin: shape.hi,
        win: shape.wi,
        cout: shape.cout,
        kd: shape.kd,
        kh: shape.kh,
        kw: shape.kw,
        dout: shape.dout,
        hout: shape.ho,
        wout: shape.wo,
        batch_dim: dims.batch_dim,
        m_dim: dims.m_dim,
        n_dim: dims.n_dim,
        do_dim: dims.do_dim,
        group_dim: dims.group_dim,
        has_bias: params.bias.is_some(),
        ..RunInfo::default()
    };
    info.set_strides(params.strides);
    info.set_dilations(params.dilations);
    info.set_pads(params.pads);
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::status_code;
    use crate::shape::{Pads, Spatial};
    use proptest::prelude::*;

    fn platform(aicore_num: u64) -> PlatformInfo {
        PlatformInfo {
            aicore_num,
            l1_size: 524_288,
            l0a_size: 65_536,
            l0b_size: 65_536,
            l0c_size: 131_072,
            ub_size: 262_144,
            bt_size: 1024,
            l2_rate: 100,
            ..PlatformInfo::ascend910b()
        }
    }

    fn engine() -> Conv3dTilingEngine {
        Conv3dTilingEngine::new(platform(32)).unwrap()
    }

    fn regular() -> ConvParams {
        ConvParams::new(
            [32, 64, 32, 128, 128],
            [128, 64, 3, 3, 3],
            [32, 128, 16, 64, 64],
            Dtype::Bf16,
        )
        .with_pads(Pads::splat(1))
        .with_strides(Spatial::splat(2))
    }

    fn assert_aligned(data: &Conv3dTilingData) {
        let t = &data.tiling;
        assert_eq!(t.m_l0 % 16, 0);
        assert_eq!(t.n_l0 % 16, 0);
        assert_eq!(t.k_l0 % 16, 0);
        assert!(t.m_al1 % t.m_l0 == 0 || t.m_al1 % 16 == 0);
        assert!(t.bl1_bypass_flag || t.n_bl1 % t.n_l0 == 0 || t.n_bl1 % 16 == 0);
    }

    #[test]
    fn test_unit_kernel_single_channel() {
        let params = ConvParams::new([1, 1, 1, 1, 1], [16, 1, 1, 1, 1], [1, 16, 1, 1, 1], Dtype::Bf16);
        let data = engine().tile(&params).unwrap();
        assert_eq!(data.run_info.cout, 16);
        assert_eq!(data.tiling.single_core_co, 16);
        assert_aligned(&data);
    }

    #[test]
    fn test_zero_stride_fails() {
        let params = regular().with_strides(Spatial { d: 1, h: 0, w: 1 });
        let result = engine().tile(&params);
        assert!(matches!(result, Err(TilingError::InvalidAttr(_))));
        assert_eq!(status_code(&result), -1);
    }

    #[test]
    fn test_regular_conv_uses_all_cores() {
        let data = engine().tile(&regular()).unwrap();
        assert_aligned(&data);
        let info = &data.run_info;
        assert!(info.core_count() <= 32);
        assert_eq!((info.stride_h, info.pad_left), (2, 1));
        assert_eq!(data.tiling.org_ho, 64);
        let decoded = Conv3dTilingData::from_payload(&data.to_payload().unwrap()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_fractal_weight_axes_checked_against_groups() {
        // D = groupOpt * ceil(64 / 16) * 27, N1 = ceil(128 / 16).
        assert!(engine()
            .tile(&regular().with_weight_fractal_axes(108, 8))
            .is_ok());
        assert!(matches!(
            engine().tile(&regular().with_weight_fractal_axes(107, 8)),
            Err(TilingError::InvalidShape(_))
        ));
        assert!(matches!(
            engine().tile(&regular().with_weight_fractal_axes(108, 4)),
            Err(TilingError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_pad_above_load3d_limit_fails() {
        let params = regular().with_pads(Pads {
            top: 256,
            ..Pads::splat(1)
        });
        assert!(matches!(
            engine().tile(&params),
            Err(TilingError::HardwareLimitExceeded(_))
        ));
    }

    #[test]
    fn test_indivisible_groups_fail() {
        let params = ConvParams::new([1, 64, 8, 16, 16], [64, 21, 3, 3, 3], [1, 64, 6, 14, 14], Dtype::Bf16)
            .with_groups(3);
        assert!(matches!(
            engine().tile(&params),
            Err(TilingError::GroupConvOptFailed(_))
        ));
    }

    #[test]
    fn test_huge_shapes_overflow() {
        let params = ConvParams::new(
            [1 << 20, 1 << 20, 1 << 10, 1 << 10, 1 << 10],
            [16, 1 << 20, 1, 1, 1],
            [1 << 20, 16, 1 << 10, 1 << 10, 1 << 10],
            Dtype::Bf16,
        );
        assert!(matches!(
            engine().tile(&params),
            Err(TilingError::ArithmeticOverflow(_))
        ));
    }

    #[test]
    fn test_hf32_on_fp32() {
        let params = ConvParams::new([1, 16, 4, 8, 8], [16, 16, 1, 1, 1], [1, 16, 4, 8, 8], Dtype::Float32)
            .with_hf32(true);
        assert!(engine().tile(&params).unwrap().tiling.hf32_enable);
        let params = ConvParams::new([1, 16, 4, 8, 8], [16, 16, 1, 1, 1], [1, 16, 4, 8, 8], Dtype::Bf16)
            .with_hf32(true);
        assert!(!engine().tile(&params).unwrap().tiling.hf32_enable);
    }

    #[test]
    fn test_stride_limit() {
        let strided = |h, ho| {
            ConvParams::new([1, 16, 1, 64, 64], [16, 16, 1, 1, 1], [1, 16, 1, ho, 64], Dtype::Bf16)
                .with_strides(Spatial { d: 1, h, w: 1 })
        };
        assert!(engine().tile(&strided(63, 2)).is_ok());
        assert!(matches!(
            engine().tile(&strided(64, 1)),
            Err(TilingError::HardwareLimitExceeded(_))
        ));
    }

    #[test]
    fn test_dilation_limit() {
        let dilated = |h, ho| {
            ConvParams::new([1, 16, 1, 1024, 8], [16, 16, 1, 3, 1], [1, 16, 1, ho, 8], Dtype::Bf16)
                .with_dilations(Spatial { d: 1, h, w: 1 })
        };
        assert!(engine().tile(&dilated(255, 514)).is_ok());
        assert!(matches!(
            engine().tile(&dilated(256, 512)),
            Err(TilingError::HardwareLimitExceeded(_))
        ));
    }

    #[test]
    fn test_single_core_is_all_ones() {
        let engine = Conv3dTilingEngine::new(platform(1)).unwrap();
        let info = engine.tile(&regular()).unwrap().run_info;
        assert_eq!(
            (info.batch_dim, info.m_dim, info.n_dim, info.do_dim, info.group_dim),
            (1, 1, 1, 1, 1)
        );
    }

    #[test]
    fn test_point_wise_with_bias() {
        let params = ConvParams::point_wise([2, 32, 4, 4, 32], [240, 32, 1, 1, 1], [2, 240, 4, 4, 32], Dtype::Bf16)
            .with_bias(Dtype::Float32);
        let data = engine().tile(&params).unwrap();
        assert!(data.run_info.has_bias);
        assert_aligned(&data);
    }

    #[test]
    fn test_zero_l2_rate_and_uninitialized_platform() {
        let mut p = platform(8);
        p.l2_rate = 0;
        assert_eq!(Conv3dTilingEngine::new(p).unwrap().platform().l2_rate, 1);
        p.l1_size = 0;
        assert!(matches!(
            Conv3dTilingEngine::new(p),
            Err(TilingError::PlatformUninitialized(_))
        ));
    }

    fn small_conv() -> impl Strategy<Value = ConvParams> {
        (
            prop::sample::select(vec![16i64, 32, 64]),
            prop::sample::select(vec![16i64, 32, 64]),
            2i64..=6,
            4i64..=20,
            1i64..=3,
            1i64..=2,
        )
            .prop_map(|(cin, cout, di, hw, k, stride)| {
                let kd = k.min(di);
                let out = (hw - k) / stride + 1;
                ConvParams::new(
                    [1, cin, di, hw, hw],
                    [cout, cin, kd, k, k],
                    [1, cout, di - kd + 1, out, out],
                    Dtype::Float16,
                )
                .with_strides(Spatial { d: 1, h: stride, w: stride })
            })
    }

    proptest! {
        #[test]
        fn test_tiling_is_aligned_and_repeatable(params in small_conv(), cores in 1u64..=32) {
            let engine = Conv3dTilingEngine::new(platform(cores)).unwrap();
            let first = engine.tile(&params).unwrap();
            assert_aligned(&first);
            prop_assert!(first.run_info.core_count() <= cores);
            prop_assert_eq!(first, engine.tile(&params).unwrap());
        }

        #[test]
        fn test_larger_l1_still_tiles(params in small_conv(), scale in 1u64..=4) {
            let base = Conv3dTilingEngine::new(platform(8)).unwrap();
            let mut bigger = platform(8);
            bigger.l1_size *= scale;
            let bigger = Conv3dTilingEngine::new(bigger).unwrap();
            if base.tile(&params).is_ok() {
                prop_assert!(bigger.tile(&params).is_ok());
            }
        }
    }
}
