//! Validation of a configured [Conv3dTiling] and resolution into the
//! unsigned values the search works on.

use super::{ApiAttrs, ApiShape, Conv3dTiling};
use crate::common::{CubeInfo, Dtype, Format, OutputOrder, QuantType, C0_SIZE};
use crate::error::{fail, TilingError};
use crate::shape::{Pads, Spatial};
use crate::target::{HardwareCapabilities, PlatformInfo};
use crate::utils::{ceil_div, checked_product};
use log::debug;

/// A validated configuration. Every dimension is positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TilingInputs {
    pub platform: PlatformInfo,
    pub caps: HardwareCapabilities,
    pub cube: CubeInfo,
    pub order: OutputOrder,
    pub quant: QuantType,

    pub fmap_size: u64,
    pub weight_size: u64,
    pub output_size: u64,
    /// Bias bytes per element as staged in L1 and BT; 0 without bias.
    pub bias_size: u64,
    pub scale_size: u64,
    pub bias_dtype: Option<Dtype>,
    /// Whether a bias is added by the cube pipeline. A bias that travels with
    /// a quantization scale is applied during the vector stage instead.
    pub has_bias: bool,
    pub hf32_enable: bool,

    pub groups: u64,
    pub group_opt: u64,
    pub single_core_group_opt: u64,
    pub org_ci: u64,
    pub org_di: u64,
    pub org_hi: u64,
    pub org_wi: u64,
    pub org_co: u64,
    pub kd: u64,
    pub kh: u64,
    pub kw: u64,
    pub org_do: u64,
    pub org_ho: u64,
    pub org_wo: u64,
    pub cin_opt: u64,
    pub cout_opt: u64,

    pub single_ci: u64,
    pub single_co: u64,
    pub single_do: u64,
    pub single_m: u64,
    pub single_ho: u64,
    pub single_ci1: u64,
    pub single_co1: u64,
    pub single_m1: u64,

    pub pads: Pads,
    pub strides: Spatial,
    pub dilations: Spatial,
}

pub(crate) fn resolve(tiling: &Conv3dTiling) -> Result<TilingInputs, TilingError> {
    let point_wise = tiling.is_point_wise();
    if point_wise {
        check_point_wise_attrs(&tiling.attrs)?;
        check_point_wise_kernels(&tiling.shape)?;
        check_org_shapes(&tiling.shape)?;
        check_single_shapes(tiling)?;
        check_constraints(&tiling.shape, &tiling.attrs)?;
        check_point_wise_formats(tiling)?;
        check_point_wise_dtypes(tiling)?;
    } else {
        check_attrs(&tiling.attrs)?;
        check_org_shapes(&tiling.shape)?;
        check_padded_input(&tiling.shape, &tiling.attrs)?;
        check_single_shapes(tiling)?;
        check_constraints(&tiling.shape, &tiling.attrs)?;
        check_formats(tiling)?;
        check_dtypes(tiling)?;
        check_load3d(tiling)?;
    }
    if tiling.hf32_trans_mode {
        return fail(TilingError::InvalidAttr(
            "hf32 trans mode is not supported".to_string(),
        ));
    }

    let Some(cube) = tiling.fmap.dtype.cube_info() else {
        return fail(TilingError::UnsupportedDtype(format!(
            "fmap dtype {} cannot feed the cube unit",
            tiling.fmap.dtype
        )));
    };
    let inputs = build_inputs(tiling, cube)?;
    check_overflow(&inputs)?;
    debug!(
        "tiling inputs: order={} singleCo={} singleDo={} singleM={} cinOpt={} coutOpt={}",
        inputs.order,
        inputs.single_co,
        inputs.single_do,
        inputs.single_m,
        inputs.cin_opt,
        inputs.cout_opt
    );
    Ok(inputs)
}

fn check_attrs(attrs: &ApiAttrs) -> Result<(), TilingError> {
    if attrs.groups < 1 || attrs.group_opt < 1 {
        return fail(TilingError::InvalidAttr(format!(
            "groups={}, groupOpt={} must be >= 1",
            attrs.groups, attrs.group_opt
        )));
    }
    if attrs.pads.as_array().iter().any(|&p| p < 0) {
        return fail(TilingError::InvalidAttr(format!(
            "pads {:?} must be >= 0",
            attrs.pads.as_array()
        )));
    }
    let Spatial { d, h, w } = attrs.strides;
    if d < 1 || h < 1 || w < 1 {
        return fail(TilingError::InvalidAttr(format!(
            "strides (d={d}, h={h}, w={w}) must be >= 1"
        )));
    }
    let Spatial { d, h, w } = attrs.dilations;
    if d < 1 || h < 1 || w < 1 {
        return fail(TilingError::InvalidAttr(format!(
            "dilations (d={d}, h={h}, w={w}) must be >= 1"
        )));
    }
    Ok(())
}

fn check_point_wise_attrs(attrs: &ApiAttrs) -> Result<(), TilingError> {
    if attrs.groups != 1 {
        return fail(TilingError::InvalidAttr(format!(
            "point-wise groups={} must be 1",
            attrs.groups
        )));
    }
    if attrs.pads != Pads::default() {
        return fail(TilingError::InvalidAttr(format!(
            "point-wise pads {:?} must be 0",
            attrs.pads.as_array()
        )));
    }
    if attrs.strides != Spatial::splat(1) || attrs.dilations != Spatial::splat(1) {
        return fail(TilingError::InvalidAttr(format!(
            "point-wise strides {:?} and dilations {:?} must be 1",
            attrs.strides, attrs.dilations
        )));
    }
    Ok(())
}

fn check_point_wise_kernels(shape: &ApiShape) -> Result<(), TilingError> {
    let org = (shape.org_kd, shape.org_kh, shape.org_kw);
    let single = (shape.single_kd, shape.single_kh, shape.single_kw);
    if org != (1, 1, 1) || single != (1, 1, 1) {
        return fail(TilingError::InvalidShape(format!(
            "point-wise kernels must be 1x1x1, got org {org:?} and single {single:?}"
        )));
    }
    Ok(())
}

fn check_org_shapes(shape: &ApiShape) -> Result<(), TilingError> {
    if shape.org_co <= 0 || shape.org_kd <= 0 || shape.org_kh <= 0 || shape.org_kw <= 0 {
        return fail(TilingError::InvalidShape(format!(
            "org weight (co={}, kd={}, kh={}, kw={}) must be > 0",
            shape.org_co, shape.org_kd, shape.org_kh, shape.org_kw
        )));
    }
    if shape.org_ci <= 0 || shape.org_di <= 0 || shape.org_hi <= 0 || shape.org_wi <= 0 {
        return fail(TilingError::InvalidShape(format!(
            "org fmap (ci={}, di={}, hi={}, wi={}) must be > 0",
            shape.org_ci, shape.org_di, shape.org_hi, shape.org_wi
        )));
    }
    Ok(())
}

/// `input + pads - dilation * (kernel - 1) - 1`, which must be non-negative
/// for the kernel to fit at least once.
fn padded_extent(input: i64, pad_a: i64, pad_b: i64, dilation: i64, kernel: i64) -> i128 {
    i128::from(input) + i128::from(pad_a) + i128::from(pad_b)
        - i128::from(dilation) * (i128::from(kernel) - 1)
        - 1
}

fn check_padded_input(shape: &ApiShape, attrs: &ApiAttrs) -> Result<(), TilingError> {
    let (p, dil) = (attrs.pads, attrs.dilations);
    let d = padded_extent(shape.org_di, p.head, p.tail, dil.d, shape.org_kd);
    let h = padded_extent(shape.org_hi, p.top, p.bottom, dil.h, shape.org_kh);
    let w = padded_extent(shape.org_wi, p.left, p.right, dil.w, shape.org_kw);
    if d < 0 || h < 0 || w < 0 {
        return fail(TilingError::InvalidShape(format!(
            "padded fmap is smaller than the dilated kernel (d={d}, h={h}, w={w})"
        )));
    }
    Ok(())
}

fn check_single_shapes(tiling: &Conv3dTiling) -> Result<(), TilingError> {
    let shape = &tiling.shape;
    if shape.single_co <= 0 || shape.single_kd <= 0 || shape.single_kh <= 0 || shape.single_kw <= 0 {
        return fail(TilingError::InvalidShape(format!(
            "single weight (co={}, kd={}, kh={}, kw={}) must be > 0",
            shape.single_co, shape.single_kd, shape.single_kh, shape.single_kw
        )));
    }
    if shape.single_ci <= 0 || shape.single_do <= 0 || shape.single_m <= 0 {
        return fail(TilingError::InvalidShape(format!(
            "single fmap (ci={}, do={}, m={}) must be > 0",
            shape.single_ci, shape.single_do, shape.single_m
        )));
    }
    if tiling.output_order == OutputOrder::Hw && (shape.single_ho <= 0 || shape.single_wo <= 0) {
        return fail(TilingError::InvalidShape(format!(
            "single output (ho={}, wo={}) must be > 0 in HW order",
            shape.single_ho, shape.single_wo
        )));
    }
    if shape.cin_opt <= 0 || shape.cout_opt <= 0 || shape.single_core_group_opt <= 0 {
        return fail(TilingError::InvalidShape(format!(
            "cinOpt={}, coutOpt={}, singleCoreGroupOpt={} must be > 0",
            shape.cin_opt, shape.cout_opt, shape.single_core_group_opt
        )));
    }
    Ok(())
}

fn check_constraints(shape: &ApiShape, attrs: &ApiAttrs) -> Result<(), TilingError> {
    let org = (shape.org_kd, shape.org_kh, shape.org_kw);
    let single = (shape.single_kd, shape.single_kh, shape.single_kw);
    if org != single {
        return fail(TilingError::InvalidShape(format!(
            "single kernel {single:?} must equal org kernel {org:?}"
        )));
    }
    if attrs.groups == 1 && (shape.org_ci != shape.cin_opt || shape.org_co != shape.cout_opt) {
        return fail(TilingError::InvalidShape(format!(
            "ungrouped conv needs cinOpt={} == orgCi={} and coutOpt={} == orgCo={}",
            shape.cin_opt, shape.org_ci, shape.cout_opt, shape.org_co
        )));
    }
    if shape.single_ci != shape.cin_opt {
        return fail(TilingError::InvalidShape(format!(
            "singleCi={} must equal cinOpt={}",
            shape.single_ci, shape.cin_opt
        )));
    }
    Ok(())
}

fn check_formats(tiling: &Conv3dTiling) -> Result<(), TilingError> {
    if tiling.weight.format != Format::FractalZ3d || tiling.fmap.format != Format::Ndc1hwc0 {
        return fail(TilingError::UnsupportedFormat(format!(
            "fmap {} / weight {}, expected NDC1HWC0 / FRACTAL_Z_3D",
            tiling.fmap.format, tiling.weight.format
        )));
    }
    Ok(())
}

fn check_point_wise_formats(tiling: &Conv3dTiling) -> Result<(), TilingError> {
    if tiling.weight.format != Format::Ncdhw || tiling.output.format != Format::Ncdhw {
        return fail(TilingError::UnsupportedFormat(format!(
            "point-wise weight {} / output {}, expected NCDHW",
            tiling.weight.format, tiling.output.format
        )));
    }
    Ok(())
}

fn check_dtypes(tiling: &Conv3dTiling) -> Result<(), TilingError> {
    let (f, w, o) = (tiling.fmap.dtype, tiling.weight.dtype, tiling.output.dtype);
    if !tiling.caps.supports_dtypes(f, w, tiling.bias, tiling.scale, o) {
        return fail(TilingError::UnsupportedDtype(format!(
            "fmap={f} weight={w} bias={:?} scale={:?} output={o}",
            tiling.bias, tiling.scale
        )));
    }
    Ok(())
}

fn check_point_wise_dtypes(tiling: &Conv3dTiling) -> Result<(), TilingError> {
    let (f, w, o) = (tiling.fmap.dtype, tiling.weight.dtype, tiling.output.dtype);
    if tiling.scale.is_some() || !tiling.caps.supports_point_wise_dtypes(f, w, tiling.bias, o) {
        return fail(TilingError::UnsupportedDtype(format!(
            "point-wise fmap={f} weight={w} bias={:?} scale={:?} output={o}",
            tiling.bias, tiling.scale
        )));
    }
    Ok(())
}

fn check_load3d(tiling: &Conv3dTiling) -> Result<(), TilingError> {
    let limits = tiling.caps.load3d;
    let (s, d, p) = (tiling.attrs.strides, tiling.attrs.dilations, tiling.attrs.pads);
    let over = |v: i64, max: u64| v as u64 > max;
    if over(s.h, limits.max_stride_hw) || over(s.w, limits.max_stride_hw) {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "strideH={}, strideW={} must be <= {}",
            s.h, s.w, limits.max_stride_hw
        )));
    }
    if over(d.h, limits.max_dilation_hw) || over(d.w, limits.max_dilation_hw) {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "dilationH={}, dilationW={} must be <= {}",
            d.h, d.w, limits.max_dilation_hw
        )));
    }
    if [p.top, p.bottom, p.left, p.right]
        .iter()
        .any(|&v| over(v, limits.max_pad_hw))
    {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "pads top={} bottom={} left={} right={} must be <= {}",
            p.top, p.bottom, p.left, p.right, limits.max_pad_hw
        )));
    }
    let (kh, kw) = (tiling.shape.org_kh, tiling.shape.org_kw);
    if over(kh, limits.max_kernel_hw) || over(kw, limits.max_kernel_hw) {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "kh={kh}, kw={kw} must be <= {}",
            limits.max_kernel_hw
        )));
    }
    let k0 = C0_SIZE / u64::from(tiling.fmap.dtype.size());
    let khw_k0 = kh as u64 * kw as u64 * k0;
    if khw_k0 > limits.max_ddr_to_l1 {
        return fail(TilingError::HardwareLimitExceeded(format!(
            "kh*kw*k0={khw_k0} must be <= {}",
            limits.max_ddr_to_l1
        )));
    }
    Ok(())
}

fn output_extent(input: i64, pad_a: i64, pad_b: i64, dilation: i64, kernel: i64, stride: i64) -> i128 {
    padded_extent(input, pad_a, pad_b, dilation, kernel) / i128::from(stride) + 1
}

fn build_inputs(tiling: &Conv3dTiling, cube: CubeInfo) -> Result<TilingInputs, TilingError> {
    let (shape, attrs) = (&tiling.shape, &tiling.attrs);
    let (p, s, d) = (attrs.pads, attrs.strides, attrs.dilations);
    let org_do = output_extent(shape.org_di, p.head, p.tail, d.d, shape.org_kd, s.d);
    let org_ho = output_extent(shape.org_hi, p.top, p.bottom, d.h, shape.org_kh, s.h);
    let org_wo = output_extent(shape.org_wi, p.left, p.right, d.w, shape.org_kw, s.w);
    if org_do <= 0 || org_ho <= 0 || org_wo <= 0 {
        return fail(TilingError::InvalidShape(format!(
            "computed output (do={org_do}, ho={org_ho}, wo={org_wo}) must be > 0"
        )));
    }

    let (f, w, o) = (tiling.fmap.dtype, tiling.weight.dtype, tiling.output.dtype);
    let quant = if tiling.scale.is_some()
        && f == Dtype::Int8
        && w == Dtype::Int8
        && matches!(o, Dtype::Bf16 | Dtype::Float16)
    {
        QuantType::PerChannelNoOffset
    } else {
        QuantType::Disable
    };
    let has_bias = tiling.bias.is_some() && tiling.scale.is_none();
    let single_m = shape.single_m as u64;
    let u = |v: i64| v as u64;
    Ok(TilingInputs {
        platform: tiling.platform,
        caps: tiling.caps,
        cube,
        order: tiling.output_order,
        quant,
        fmap_size: f.size().into(),
        weight_size: w.size().into(),
        output_size: o.size().into(),
        bias_size: tiling.bias.map_or(0, |b| b.size().into()),
        scale_size: tiling.scale.map_or(0, |s| s.size().into()),
        bias_dtype: tiling.bias,
        has_bias,
        hf32_enable: tiling.hf32_enable,
        groups: u(attrs.groups),
        group_opt: u(attrs.group_opt),
        single_core_group_opt: u(shape.single_core_group_opt),
        org_ci: u(shape.org_ci),
        org_di: u(shape.org_di),
        org_hi: u(shape.org_hi),
        org_wi: u(shape.org_wi),
        org_co: u(shape.org_co),
        kd: u(shape.org_kd),
        kh: u(shape.org_kh),
        kw: u(shape.org_kw),
        org_do: org_do as u64,
        org_ho: org_ho as u64,
        org_wo: org_wo as u64,
        cin_opt: u(shape.cin_opt),
        cout_opt: u(shape.cout_opt),
        single_ci: u(shape.single_ci),
        single_co: u(shape.single_co),
        single_do: u(shape.single_do),
        single_m,
        single_ho: u(shape.single_ho),
        single_ci1: ceil_div(u(shape.single_ci), cube.k0),
        single_co1: ceil_div(u(shape.single_co), cube.n0),
        single_m1: ceil_div(single_m, cube.m0),
        pads: p,
        strides: s,
        dilations: d,
    })
}

/// Rejects shapes whose fmap, weight, or output byte size cannot be
/// represented.
fn check_overflow(inputs: &TilingInputs) -> Result<(), TilingError> {
    let cube = inputs.cube;
    let cin1 = ceil_div(inputs.cin_opt, cube.k0);
    let fmap = checked_product(&[
        inputs.org_di,
        inputs.group_opt,
        cin1,
        inputs.org_hi,
        inputs.org_wi,
        cube.k0 * inputs.fmap_size,
    ]);
    let weight = checked_product(&[
        inputs.group_opt,
        inputs.kd,
        cin1,
        inputs.kh,
        inputs.kw,
        ceil_div(inputs.cout_opt, cube.n0),
        cube.n0 * cube.k0 * inputs.weight_size,
    ]);
    let output = checked_product(&[
        inputs.org_do,
        inputs.group_opt,
        ceil_div(inputs.cout_opt, cube.k0),
        inputs.org_ho,
        inputs.org_wo,
        cube.k0 * inputs.output_size,
    ]);
    if fmap.is_none() || weight.is_none() || output.is_none() {
        return fail(TilingError::ArithmeticOverflow(
            "fmap, weight, or output byte size exceeds u64".to_string(),
        ));
    }
    Ok(())
}
