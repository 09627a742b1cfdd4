//! Legality checks run before any tiling search.
//!
//! Each check is independent and returns the first violation it finds.
//! [check_all] runs them in a fixed order; the group-dependent checks
//! ([check_weight_channels], [check_overflow]) run once groups are folded.

use crate::common::{CubeInfo, Format};
use crate::error::{fail, TilingError};
use crate::shape::{
    ConvParams, GroupOpt, ShapeInfo, VectorOperand, FMAP_C, FMAP_D, FMAP_H, FMAP_N, FMAP_W,
    WEIGHT_CIN, WEIGHT_COUT, WEIGHT_KD, WEIGHT_KH, WEIGHT_KW,
};
use crate::target::HardwareCapabilities;
use crate::utils::{ceil_div, checked_product};
use log::warn;

pub fn check_all(
    params: &ConvParams,
    caps: &HardwareCapabilities,
) -> Result<ShapeInfo, TilingError> {
    check_ranks(params)?;
    check_strides(params)?;
    check_dilations(params)?;
    check_pads(params, caps)?;
    check_fmap_shape(params)?;
    check_weight_shape(params)?;
    check_output_shape(params)?;
    check_formats(params)?;
    check_dtypes(params, caps)?;
    check_vector_operands(params)?;
    check_padded_input(params)?;
    let shape = shape_info(params);
    check_output_matches(params, &shape)?;
    if !params.is_point_wise() {
        check_load3d(params, caps)?;
    }
    warn_size_limits(&shape, caps);
    Ok(shape)
}

pub fn check_ranks(params: &ConvParams) -> Result<(), TilingError> {
    for (name, shape) in [
        ("fmap", &params.fmap_shape),
        ("weight", &params.weight_shape),
        ("output", &params.output_shape),
    ] {
        if shape.len() != 5 {
            return fail(TilingError::InvalidShape(format!(
                "{name} must have rank 5, got {:?}",
                shape.as_slice()
            )));
        }
    }
    Ok(())
}

pub fn check_strides(params: &ConvParams) -> Result<(), TilingError> {
    let s = params.strides;
    if [s.d, s.h, s.w].iter().any(|&v| v <= 0 || v > i64::from(i32::MAX)) {
        return fail(TilingError::InvalidAttr(format!(
            "strides (d={}, h={}, w={}) must be in [1, {}]",
            s.d,
            s.h,
            s.w,
            i32::MAX
        )));
    }
    Ok(())
}

pub fn check_dilations(params: &ConvParams) -> Result<(), TilingError> {
    let d = params.dilations;
    if [d.d, d.h, d.w].iter().any(|&v| v <= 0 || v > i64::from(i32::MAX)) {
        return fail(TilingError::InvalidAttr(format!(
            "dilations (d={}, h={}, w={}) must be in [1, {}]",
            d.d,
            d.h,
            d.w,
            i32::MAX
        )));
    }
    Ok(())
}

pub fn check_pads(params: &ConvParams, caps: &HardwareCapabilities) -> Result<(), TilingError> {
    let p = params.pads;
    if p.as_array().iter().any(|&v| v < 0) {
        return fail(TilingError::InvalidAttr(format!(
            "pads {:?} must be >= 0",
            p.as_array()
        )));
    }
    let max_pad = caps.load3d.max_pad_hw as i64;
    if [p.top, p.bottom, p.left, p.right]
        .iter()
        .any(|&v| v > max_pad)
    {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "pads top={}, bottom={}, left={}, right={} must be <= {max_pad}",
            p.top, p.bottom, p.left, p.right
        )));
    }
    Ok(())
}

fn check_positive(name: &str, shape: &[i64]) -> Result<(), TilingError> {
    if shape.iter().any(|&v| v <= 0) {
        return fail(TilingError::InvalidShape(format!(
            "{name} shape {shape:?} must be positive"
        )));
    }
    Ok(())
}

pub fn check_fmap_shape(params: &ConvParams) -> Result<(), TilingError> {
    check_positive("fmap", &params.fmap_shape)
}

pub fn check_weight_shape(params: &ConvParams) -> Result<(), TilingError> {
    check_positive("weight", &params.weight_shape)?;
    if params.fmap.dtype.cube_info().is_none() {
        return fail(TilingError::UnsupportedDtype(format!(
            "no cube unit shape for fmap dtype {}",
            params.fmap.dtype
        )));
    }
    Ok(())
}

pub fn check_output_shape(params: &ConvParams) -> Result<(), TilingError> {
    check_positive("output", &params.output_shape)
}

pub fn check_formats(params: &ConvParams) -> Result<(), TilingError> {
    let formats = (params.fmap.format, params.weight.format, params.output.format);
    if params.is_point_wise() {
        if params.scale.is_some() {
            return fail(TilingError::UnsupportedFormat(
                "quantized convolutions require NDC1HWC0 fmap".to_string(),
            ));
        }
        if formats != (Format::Ncdhw, Format::Ncdhw, Format::Ncdhw) {
            return fail(TilingError::UnsupportedFormat(format!(
                "point-wise convolutions require NCDHW operands, got fmap {}, weight {}, output {}",
                formats.0, formats.1, formats.2
            )));
        }
        let w = &params.weight_shape;
        if (w[WEIGHT_KD], w[WEIGHT_KH], w[WEIGHT_KW]) != (1, 1, 1) {
            return fail(TilingError::UnsupportedFormat(format!(
                "NCDHW fmap requires a 1x1x1 kernel, got {}x{}x{}",
                w[WEIGHT_KD], w[WEIGHT_KH], w[WEIGHT_KW]
            )));
        }
        let (s, d) = (params.strides, params.dilations);
        if params.pads.as_array() != [0; 6]
            || (s.d, s.h, s.w) != (1, 1, 1)
            || (d.d, d.h, d.w) != (1, 1, 1)
            || params.groups != 1
        {
            return fail(TilingError::InvalidAttr(
                "point-wise convolutions require zero pads, unit strides and dilations, one group"
                    .to_string(),
            ));
        }
    } else if params.scale.is_some() {
        if formats != (Format::Ndc1hwc0, Format::FractalZ3d, Format::Ncdhw) {
            return fail(TilingError::UnsupportedFormat(format!(
                "quantized convolutions require NDC1HWC0/FRACTAL_Z_3D/NCDHW, got {}/{}/{}",
                formats.0, formats.1, formats.2
            )));
        }
    } else if formats != (Format::Ndc1hwc0, Format::FractalZ3d, Format::Ndc1hwc0) {
        return fail(TilingError::UnsupportedFormat(format!(
            "expected NDC1HWC0/FRACTAL_Z_3D/NDC1HWC0, got {}/{}/{}",
            formats.0, formats.1, formats.2
        )));
    }
    Ok(())
}

pub fn check_dtypes(params: &ConvParams, caps: &HardwareCapabilities) -> Result<(), TilingError> {
    let bias = params.bias.as_ref().map(|b| b.desc.dtype);
    let scale = params.scale.as_ref().map(|s| s.desc.dtype);
    let (fmap, weight, output) = (params.fmap.dtype, params.weight.dtype, params.output.dtype);
    let supported = if params.is_point_wise() {
        caps.supports_point_wise_dtypes(fmap, weight, bias, output)
    } else {
        caps.supports_dtypes(fmap, weight, bias, scale, output)
    };
    if !supported {
        return fail(TilingError::UnsupportedDtype(format!(
            "[fmap, weight, bias, scale, output] = [{fmap}, {weight}, {bias:?}, {scale:?}, {output}]"
        )));
    }
    Ok(())
}

pub fn check_vector_operands(params: &ConvParams) -> Result<(), TilingError> {
    let cout = params.weight_shape[WEIGHT_COUT];
    let operands = [("bias", &params.bias), ("scale", &params.scale)];
    for (name, operand) in operands {
        let Some(VectorOperand { desc, shape }) = operand else {
            continue;
        };
        if desc.format != Format::Nd {
            return fail(TilingError::UnsupportedFormat(format!(
                "{name} format must be ND, got {}",
                desc.format
            )));
        }
        if shape.as_slice() != [cout] {
            return fail(TilingError::InvalidShape(format!(
                "{name} shape {:?} must be [{cout}]",
                shape.as_slice()
            )));
        }
    }
    Ok(())
}

/// Each padded input extent must fit at least one dilated kernel window.
pub fn check_padded_input(params: &ConvParams) -> Result<(), TilingError> {
    let f = &params.fmap_shape;
    let w = &params.weight_shape;
    let (p, d) = (params.pads, params.dilations);
    let axes = [
        ("D", f[FMAP_D], p.head, p.tail, d.d, w[WEIGHT_KD]),
        ("H", f[FMAP_H], p.top, p.bottom, d.h, w[WEIGHT_KH]),
        ("W", f[FMAP_W], p.left, p.right, d.w, w[WEIGHT_KW]),
    ];
    for (axis, input, pad_a, pad_b, dilation, kernel) in axes {
        let dilated = dilation
            .checked_mul(kernel - 1)
            .and_then(|v| v.checked_add(1));
        let padded = input.checked_add(pad_a).and_then(|v| v.checked_add(pad_b));
        match (padded, dilated) {
            (Some(padded), Some(dilated)) if padded >= dilated => {}
            _ => {
                return fail(TilingError::InvalidShape(format!(
                    "padded input {axis} ({input} + {pad_a} + {pad_b}) is smaller than the \
                     dilated kernel ({dilation} * ({kernel} - 1) + 1)"
                )));
            }
        }
    }
    Ok(())
}

fn shape_info(params: &ConvParams) -> ShapeInfo {
    let f = &params.fmap_shape;
    let w = &params.weight_shape;
    let o = &params.output_shape;
    ShapeInfo {
        batch: f[FMAP_N] as u64,
        cin: f[FMAP_C] as u64,
        di: f[FMAP_D] as u64,
        hi: f[FMAP_H] as u64,
        wi: f[FMAP_W] as u64,
        cout: w[WEIGHT_COUT] as u64,
        kd: w[WEIGHT_KD] as u64,
        kh: w[WEIGHT_KH] as u64,
        kw: w[WEIGHT_KW] as u64,
        dout: o[FMAP_D] as u64,
        ho: o[FMAP_H] as u64,
        wo: o[FMAP_W] as u64,
    }
}

/// Output extent of one spatial axis. Assumes [check_padded_input] passed.
pub fn output_extent(input: u64, pad_a: u64, pad_b: u64, dilation: u64, kernel: u64, stride: u64) -> u64 {
    (input + pad_a + pad_b - dilation * (kernel - 1) - 1) / stride + 1
}

pub fn check_output_matches(params: &ConvParams, shape: &ShapeInfo) -> Result<(), TilingError> {
    let (p, d, s) = (params.pads, params.dilations, params.strides);
    let expected = [
        shape.batch,
        shape.cout,
        output_extent(shape.di, p.head as u64, p.tail as u64, d.d as u64, shape.kd, s.d as u64),
        output_extent(shape.hi, p.top as u64, p.bottom as u64, d.h as u64, shape.kh, s.h as u64),
        output_extent(shape.wi, p.left as u64, p.right as u64, d.w as u64, shape.kw, s.w as u64),
    ];
    let actual = params.output_shape.iter().map(|&v| v as u64);
    if !actual.eq(expected.iter().copied()) {
        return fail(TilingError::InvalidShape(format!(
            "output shape {:?} does not match the computed {expected:?}",
            params.output_shape.as_slice()
        )));
    }
    Ok(())
}

pub fn check_load3d(params: &ConvParams, caps: &HardwareCapabilities) -> Result<(), TilingError> {
    let limits = &caps.load3d;
    let (s, d) = (params.strides, params.dilations);
    if s.h as u64 > limits.max_stride_hw || s.w as u64 > limits.max_stride_hw {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "strideH={}, strideW={} must be <= {}",
            s.h, s.w, limits.max_stride_hw
        )));
    }
    if d.h as u64 > limits.max_dilation_hw || d.w as u64 > limits.max_dilation_hw {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "dilationH={}, dilationW={} must be <= {}",
            d.h, d.w, limits.max_dilation_hw
        )));
    }
    let (kh, kw) = (
        params.weight_shape[WEIGHT_KH] as u64,
        params.weight_shape[WEIGHT_KW] as u64,
    );
    if kh > limits.max_kernel_hw || kw > limits.max_kernel_hw {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "kh={kh}, kw={kw} must be <= {}",
            limits.max_kernel_hw
        )));
    }
    let k0 = crate::common::C0_SIZE / u64::from(params.fmap.dtype.size());
    if kh * kw * k0 > limits.max_ddr_to_l1 {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "kh*kw*k0={} must be <= {}",
            kh * kw * k0,
            limits.max_ddr_to_l1
        )));
    }
    Ok(())
}

/// Oversized dimensions are legal but untested on hardware.
pub fn warn_size_limits(shape: &ShapeInfo, caps: &HardwareCapabilities) {
    let dims = [
        ("batch", shape.batch),
        ("cin", shape.cin),
        ("di", shape.di),
        ("hi", shape.hi),
        ("wi", shape.wi),
        ("cout", shape.cout),
        ("kd", shape.kd),
        ("kh", shape.kh),
        ("kw", shape.kw),
        ("dout", shape.dout),
        ("ho", shape.ho),
        ("wo", shape.wo),
    ];
    for (name, value) in dims {
        if value > caps.max_ori_one_dim {
            warn!(
                "{name} ({value}) is out of range [1, {}]",
                caps.max_ori_one_dim
            );
        }
    }
    let fmap_size = [shape.batch, shape.cin, shape.di, shape.hi, shape.wi]
        .iter()
        .fold(1u64, |acc, &v| acc.saturating_mul(v));
    if fmap_size > caps.max_ori_fmap_size {
        warn!(
            "batch*cin*di*hi*wi ({fmap_size}) is out of range [1, {}]",
            caps.max_ori_fmap_size
        );
    }
}

/// Weight must carry exactly `cin / groups` input channels.
pub fn check_weight_channels(params: &ConvParams, shape: &ShapeInfo) -> Result<(), TilingError> {
    let groups = params.groups as u64;
    let weight_cin = params.weight_shape[WEIGHT_CIN] as u64;
    if weight_cin * groups != shape.cin {
        return fail(TilingError::InvalidShape(format!(
            "weight Cin ({weight_cin}) * groups ({groups}) != fmap C ({})",
            shape.cin
        )));
    }
    Ok(())
}

/// Byte sizes of the whole fmap, weight, and output must fit in a `u64`.
pub fn check_overflow(
    params: &ConvParams,
    shape: &ShapeInfo,
    group: &GroupOpt,
    cube: &CubeInfo,
) -> Result<(), TilingError> {
    let fsize = u64::from(params.fmap.dtype.size());
    let wsize = u64::from(params.weight.dtype.size());
    let osize = u64::from(params.output.dtype.size());
    let products = [
        (
            "fmap",
            vec![
                shape.batch,
                shape.di,
                group.group_opt,
                ceil_div(group.cin_opt, cube.k0),
                shape.hi,
                shape.wi,
                cube.k0 * fsize,
            ],
        ),
        (
            "weight",
            vec![
                group.group_opt,
                shape.kd,
                ceil_div(group.cin_opt, cube.k0),
                shape.kh,
                shape.kw,
                ceil_div(group.cout_opt, cube.n0),
                cube.n0 * cube.k0 * wsize,
            ],
        ),
        (
            "output",
            vec![
                shape.batch,
                shape.dout,
                group.group_opt,
                ceil_div(group.cout_opt, cube.k0),
                shape.ho,
                shape.wo,
                cube.k0 * osize,
            ],
        ),
    ];
    for (name, factors) in products {
        if checked_product(&factors).is_none() {
            return fail(TilingError::ArithmeticOverflow(format!(
                "{name} size {factors:?} exceeds u64"
            )));
        }
    }
    Ok(())
}

/// Verifies a FRACTAL_Z_3D weight's folded axes against the group folding:
/// `d_axis == groupOpt * ceil(cinOpt / k0) * kd * kh * kw` and
/// `n1_axis == ceil(coutOpt / n0)`.
pub fn check_group_opt_against_weight_shape(
    d_axis: u64,
    n1_axis: u64,
    shape: &ShapeInfo,
    group: &GroupOpt,
    cube: &CubeInfo,
) -> Result<(), TilingError> {
    let expected_d = checked_product(&[
        group.group_opt,
        ceil_div(group.cin_opt, cube.k0),
        shape.kd,
        shape.kh,
        shape.kw,
    ]);
    let expected_n1 = ceil_div(group.cout_opt, cube.n0);
    if expected_d != Some(d_axis) || expected_n1 != n1_axis {
        return fail(TilingError::InvalidShape(format!(
            "fractal weight (D={d_axis}, N1={n1_axis}) disagrees with group folding \
             (D={expected_d:?}, N1={expected_n1})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::shape::{Pads, Spatial};
    use crate::target::SocVersion;

    fn caps() -> HardwareCapabilities {
        SocVersion::Ascend910B.capabilities()
    }

    fn base() -> ConvParams {
        ConvParams::new([1, 16, 8, 16, 16], [16, 16, 3, 3, 3], [1, 16, 6, 14, 14], Dtype::Bf16)
    }

    #[test]
    fn test_base_params_pass() {
        let shape = check_all(&base(), &caps()).unwrap();
        assert_eq!((shape.dout, shape.ho, shape.wo), (6, 14, 14));
    }

    #[test]
    fn test_zero_and_negative_strides_rejected() {
        for bad in [0, -1] {
            let params = base().with_strides(Spatial { d: 1, h: bad, w: 1 });
            assert!(matches!(
                check_all(&params, &caps()),
                Err(TilingError::InvalidAttr(_))
            ));
        }
    }

    #[test]
    fn test_depth_pad_has_no_load3d_ceiling() {
        let mut params = base().with_pads(Pads {
            head: 300,
            tail: 300,
            ..Pads::default()
        });
        params.output_shape[FMAP_D] = 606;
        assert!(check_all(&params, &caps()).is_ok());
    }

    #[test]
    fn test_pad_above_load3d_limit() {
        let params = base().with_pads(Pads {
            top: 256,
            ..Pads::default()
        });
        assert!(matches!(
            check_pads(&params, &caps()),
            Err(TilingError::HardwareLimitExceeded(_))
        ));
    }

    #[test]
    fn test_padded_input_exactly_one_window() {
        let params = ConvParams::new([1, 16, 3, 5, 5], [16, 16, 3, 5, 5], [1, 16, 1, 1, 1], Dtype::Bf16);
        let shape = check_all(&params, &caps()).unwrap();
        assert_eq!((shape.dout, shape.ho, shape.wo), (1, 1, 1));
    }

    #[test]
    fn test_padded_input_too_small() {
        let params = ConvParams::new([1, 16, 2, 5, 5], [16, 16, 3, 5, 5], [1, 16, 1, 1, 1], Dtype::Bf16);
        assert!(matches!(
            check_padded_input(&params),
            Err(TilingError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_unsupported_dtype_combination() {
        let params = base().with_output_dtype(Dtype::Float32);
        assert!(matches!(
            check_all(&params, &caps()),
            Err(TilingError::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn test_bias_length_must_match_cout() {
        let mut params = base().with_bias(Dtype::Float32);
        if let Some(bias) = params.bias.as_mut() {
            bias.shape[0] = 15;
        }
        assert!(matches!(
            check_all(&params, &caps()),
            Err(TilingError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_point_wise_needs_unit_kernel() {
        let params = ConvParams::point_wise([1, 16, 4, 4, 4], [16, 16, 1, 3, 1], [1, 16, 4, 2, 4], Dtype::Bf16);
        assert!(matches!(
            check_all(&params, &caps()),
            Err(TilingError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_mismatched_output_shape() {
        let mut params = base();
        params.output_shape[FMAP_H] = 13;
        assert!(matches!(
            check_all(&params, &caps()),
            Err(TilingError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_group_opt_against_weight_shape() {
        let shape = check_all(&base(), &caps()).unwrap();
        let cube = Dtype::Bf16.cube_info().unwrap();
        let group = GroupOpt {
            group_opt: 1,
            cin_opt: 16,
            cout_opt: 16,
        };
        assert!(check_group_opt_against_weight_shape(27, 1, &shape, &group, &cube).is_ok());
        assert!(check_group_opt_against_weight_shape(26, 1, &shape, &group, &cube).is_err());
    }
}
