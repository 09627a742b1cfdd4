use crate::common::{OutputOrder, C0_SIZE};
use crate::error::{fail, TilingError};
use crate::shape::{ConvParams, ShapeInfo};
use crate::target::HardwareCapabilities;
use crate::utils::{align_up, infer_hi_l1, infer_wi_l1};
use log::debug;

/// Smallest L1 footprint (bytes) of one fmap load plus one bias slice under
/// the given output order, for a single `m0`-row output tile.
pub fn min_l1_load_size(params: &ConvParams, shape: &ShapeInfo, order: OutputOrder) -> Option<u64> {
    let cube = params.fmap.dtype.cube_info()?;
    let fsize = u64::from(params.fmap.dtype.size());
    let (s, d) = (params.strides, params.dilations);
    let hi_l1 = |rows| infer_hi_l1(rows, shape.hi, shape.kh, d.h as u64, s.h as u64);
    let min_bias = match &params.bias {
        Some(bias) => align_up(cube.n0 * u64::from(bias.desc.dtype.size()), C0_SIZE),
        None => 0,
    };
    let area = match order {
        OutputOrder::M => hi_l1(cube.m0 / shape.wo + 2) * shape.wi,
        OutputOrder::Hw => {
            hi_l1(1) * infer_wi_l1(cube.m0, shape.wi, shape.kw, d.w as u64, s.w as u64)
        }
    };
    Some(area * cube.k0 * fsize + min_bias)
}

/// Picks M mode when a minimal M tile fits in L1, otherwise falls back to HW
/// mode, which only ungrouped non-point-wise convs support.
pub fn init_output_order(
    params: &ConvParams,
    shape: &ShapeInfo,
    l1_size: u64,
    caps: &HardwareCapabilities,
) -> Result<OutputOrder, TilingError> {
    let fits = |order| {
        min_l1_load_size(params, shape, order).is_some_and(|size| size <= l1_size)
    };
    if fits(OutputOrder::M) {
        debug!("output order: M");
        return Ok(OutputOrder::M);
    }
    if params.is_point_wise() {
        return fail(TilingError::NoValidOutputOrder(
            "point-wise fmap tile exceeds L1 and HW mode is unavailable".to_string(),
        ));
    }
    if !caps.hw_mode_dtypes.contains(&params.fmap.dtype) || params.groups != 1 {
        return fail(TilingError::NoValidOutputOrder(format!(
            "M mode exceeds L1 ({l1_size} bytes) and HW mode does not support dtype {} with groups={}",
            params.fmap.dtype, params.groups
        )));
    }
    if fits(OutputOrder::Hw) {
        debug!("output order: HW");
        return Ok(OutputOrder::Hw);
    }
    fail(TilingError::NoValidOutputOrder(format!(
        "neither M nor HW mode fits a minimal fmap tile in L1 ({l1_size} bytes)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::target::SocVersion;

    fn shape() -> ShapeInfo {
        ShapeInfo {
            batch: 1,
            cin: 16,
            di: 8,
            hi: 64,
            wi: 64,
            cout: 32,
            kd: 3,
            kh: 3,
            kw: 1,
            dout: 8,
            ho: 64,
            wo: 64,
        }
    }

    fn params(groups: i64) -> ConvParams {
        ConvParams::new([1, 16, 8, 64, 64], [32, 16 / groups, 3, 3, 1], [1, 32, 8, 64, 64], Dtype::Bf16)
            .with_groups(groups)
    }

    #[test]
    fn test_large_l1_prefers_m_mode() {
        let caps = SocVersion::Ascend910B.capabilities();
        let order = init_output_order(&params(1), &shape(), 10 * 1024 * 1024, &caps).unwrap();
        assert_eq!(order, OutputOrder::M);
    }

    #[test]
    fn test_small_l1_falls_back_to_hw_mode() {
        let caps = SocVersion::Ascend910B.capabilities();
        let order = init_output_order(&params(1), &shape(), 2000, &caps).unwrap();
        assert_eq!(order, OutputOrder::Hw);
    }

    #[test]
    fn test_grouped_conv_has_no_hw_mode() {
        let caps = SocVersion::Ascend910B.capabilities();
        assert!(matches!(
            init_output_order(&params(2), &shape(), 2000, &caps),
            Err(TilingError::NoValidOutputOrder(_))
        ));
    }

    #[test]
    fn test_point_wise_is_decided_by_format() {
        let caps = SocVersion::Ascend910B.capabilities();
        let unit = ShapeInfo {
            kd: 1,
            kh: 1,
            ..shape()
        };
        let (fmap, weight, output) = ([1, 16, 8, 64, 64], [32, 16, 1, 1, 1], [1, 32, 8, 64, 64]);
        // A 1x1x1 kernel in the 5HD layouts may still use HW mode.
        let regular = ConvParams::new(fmap, weight, output, Dtype::Bf16);
        assert_eq!(
            init_output_order(&regular, &unit, 2000, &caps).unwrap(),
            OutputOrder::Hw
        );
        let point_wise = ConvParams::point_wise(fmap, weight, output, Dtype::Bf16);
        assert!(matches!(
            init_output_order(&point_wise, &unit, 2000, &caps),
            Err(TilingError::NoValidOutputOrder(_))
        ));
    }

    #[test]
    fn test_min_l1_load_sizes() {
        let p = params(1);
        let s = shape();
        // 4 rows * 64 cols * 16 * 2 bytes
        assert_eq!(min_l1_load_size(&p, &s, OutputOrder::M), Some(8192));
        // 3 rows * 16 cols * 16 * 2 bytes
        assert_eq!(min_l1_load_size(&p, &s, OutputOrder::Hw), Some(1536));
    }
}
