use crate::common::{Dtype, Format, TensorDesc};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

/// Caller-supplied dimensions. Signed so that malformed input can be
/// represented and rejected.
pub type OrigShape = SmallVec<[i64; 5]>;

pub const FMAP_N: usize = 0;
pub const FMAP_C: usize = 1;
pub const FMAP_D: usize = 2;
pub const FMAP_H: usize = 3;
pub const FMAP_W: usize = 4;

pub const WEIGHT_COUT: usize = 0;
pub const WEIGHT_CIN: usize = 1;
pub const WEIGHT_KD: usize = 2;
pub const WEIGHT_KH: usize = 3;
pub const WEIGHT_KW: usize = 4;

/// One value per spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Spatial {
    pub d: i64,
    pub h: i64,
    pub w: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct Pads {
    pub head: i64,
    pub tail: i64,
    pub top: i64,
    pub bottom: i64,
    pub left: i64,
    pub right: i64,
}

/// Optional rank-1 operand such as bias or a quantization scale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct VectorOperand {
    pub desc: TensorDesc,
    pub shape: OrigShape,
}

/// A complete description of one Conv3D instance as the operator layer sees
/// it: fmap is `[N, C, D, H, W]`, weight `[Cout, Cin/groups, Kd, Kh, Kw]`,
/// output `[N, Cout, Do, Ho, Wo]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ConvParams {
    pub fmap_shape: OrigShape,
    pub weight_shape: OrigShape,
    pub output_shape: OrigShape,
    pub fmap: TensorDesc,
    pub weight: TensorDesc,
    pub output: TensorDesc,
    pub bias: Option<VectorOperand>,
    pub scale: Option<VectorOperand>,
    pub pads: Pads,
    pub strides: Spatial,
    pub dilations: Spatial,
    pub groups: i64,
    pub hf32: bool,
    /// FRACTAL_Z_3D storage axes `(D, N1)` of the weight, when known.
    pub weight_fractal_axes: Option<(u64, u64)>,
}

/// Validated, unsigned view of a [ConvParams]' dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeInfo {
    pub batch: u64,
    pub cin: u64,
    pub di: u64,
    pub hi: u64,
    pub wi: u64,
    pub cout: u64,
    pub kd: u64,
    pub kh: u64,
    pub kw: u64,
    pub dout: u64,
    pub ho: u64,
    pub wo: u64,
}

/// Result of folding groups so each group fills the cube unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct GroupOpt {
    pub group_opt: u64,
    pub cin_opt: u64,
    pub cout_opt: u64,
}

impl Spatial {
    pub fn splat(v: i64) -> Self {
        Spatial { d: v, h: v, w: v }
    }
}

impl Pads {
    pub fn splat(v: i64) -> Self {
        Pads {
            head: v,
            tail: v,
            top: v,
            bottom: v,
            left: v,
            right: v,
        }
    }

    pub fn as_array(&self) -> [i64; 6] {
        [
            self.head,
            self.tail,
            self.top,
            self.bottom,
            self.left,
            self.right,
        ]
    }
}

impl VectorOperand {
    pub fn new(dtype: Dtype, len: i64) -> Self {
        VectorOperand {
            desc: TensorDesc::new(Format::Nd, dtype),
            shape: smallvec![len],
        }
    }
}

impl ConvParams {
    /// A unit-stride, unpadded, ungrouped convolution in the NDC1HWC0 /
    /// FRACTAL_Z_3D layouts with one dtype throughout.
    pub fn new(fmap_shape: [i64; 5], weight_shape: [i64; 5], output_shape: [i64; 5], dtype: Dtype) -> Self {
        ConvParams {
            fmap_shape: SmallVec::from_slice(&fmap_shape),
            weight_shape: SmallVec::from_slice(&weight_shape),
            output_shape: SmallVec::from_slice(&output_shape),
            fmap: TensorDesc::new(Format::Ndc1hwc0, dtype),
            weight: TensorDesc::new(Format::FractalZ3d, dtype),
            output: TensorDesc::new(Format::Ndc1hwc0, dtype),
            bias: None,
            scale: None,
            pads: Pads::default(),
            strides: Spatial::splat(1),
            dilations: Spatial::splat(1),
            groups: 1,
            hf32: false,
            weight_fractal_axes: None,
        }
    }

    /// Like [ConvParams::new], but every operand is NCDHW.
    pub fn point_wise(fmap_shape: [i64; 5], weight_shape: [i64; 5], output_shape: [i64; 5], dtype: Dtype) -> Self {
        let mut params = Self::new(fmap_shape, weight_shape, output_shape, dtype);
        params.fmap.format = Format::Ncdhw;
        params.weight.format = Format::Ncdhw;
        params.output.format = Format::Ncdhw;
        params
    }

    pub fn with_pads(mut self, pads: Pads) -> Self {
        self.pads = pads;
        self
    }

    pub fn with_strides(mut self, strides: Spatial) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_dilations(mut self, dilations: Spatial) -> Self {
        self.dilations = dilations;
        self
    }

    pub fn with_groups(mut self, groups: i64) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self, dtype: Dtype) -> Self {
        let cout = self.weight_shape.get(WEIGHT_COUT).copied().unwrap_or(0);
        self.bias = Some(VectorOperand::new(dtype, cout));
        self
    }

    pub fn with_scale(mut self, dtype: Dtype) -> Self {
        let cout = self.weight_shape.get(WEIGHT_COUT).copied().unwrap_or(0);
        self.scale = Some(VectorOperand::new(dtype, cout));
        self
    }

    pub fn with_output_dtype(mut self, dtype: Dtype) -> Self {
        self.output.dtype = dtype;
        self
    }

    pub fn with_hf32(mut self, hf32: bool) -> Self {
        self.hf32 = hf32;
        self
    }

    pub fn with_weight_fractal_axes(mut self, d_axis: u64, n1_axis: u64) -> Self {
        self.weight_fractal_axes = Some((d_axis, n1_axis));
        self
    }

    pub fn is_point_wise(&self) -> bool {
        self.fmap.format == Format::Ncdhw
    }
}
