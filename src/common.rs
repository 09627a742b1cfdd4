use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Bytes in one C0 block of the 5HD layout.
pub const C0_SIZE: u64 = 32;

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
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Float16,
    Bf16,
    Float32,
    Int8,
    Int32,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, enum_iterator::Sequence,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Format {
    Ncdhw,
    Ndc1hwc0,
    FractalZ3d,
    Nd,
}

/// Data type and memory layout of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TensorDesc {
    pub format: Format,
    pub dtype: Dtype,
}

/// Native tile of the cube unit for an input dtype, plus the accumulator dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubeInfo {
    pub m0: u64,
    pub k0: u64,
    pub n0: u64,
    pub mad_dtype: Dtype,
}

/// How the output spatial extent is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum OutputOrder {
    /// Flattened Ho*Wo.
    #[default]
    M,
    /// Separate Ho and Wo.
    Hw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum IterateOrder {
    #[default]
    MFirst,
    NFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum QuantType {
    #[default]
    Disable,
    PerChannelNoOffset,
}

/// Granularity at which scale and bias are staged in UB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum ScaleBiasLoad {
    #[default]
    SingleCo,
    NL0,
    NUb,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match &self {
            Dtype::Int8 => 1,
            Dtype::Float16 | Dtype::Bf16 => 2,
            Dtype::Float32 | Dtype::Int32 => 4,
        }
    }

    pub fn is_half(&self) -> bool {
        matches!(self, Dtype::Float16 | Dtype::Bf16)
    }

    /// Returns `None` for dtypes the cube unit cannot take as an input.
    pub fn cube_info(&self) -> Option<CubeInfo> {
        let (k0, mad_dtype) = match self {
            Dtype::Float16 | Dtype::Bf16 => (16, Dtype::Float32),
            Dtype::Float32 => (8, Dtype::Float32),
            Dtype::Int8 => (32, Dtype::Int32),
            Dtype::Int32 => return None,
        };
        Some(CubeInfo {
            m0: 16,
            k0,
            n0: 16,
            mad_dtype,
        })
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Float16 => write!(f, "fp16"),
            Dtype::Bf16 => write!(f, "bf16"),
            Dtype::Float32 => write!(f, "fp32"),
            Dtype::Int8 => write!(f, "int8"),
            Dtype::Int32 => write!(f, "int32"),
        }
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Ncdhw => write!(f, "NCDHW"),
            Format::Ndc1hwc0 => write!(f, "NDC1HWC0"),
            Format::FractalZ3d => write!(f, "FRACTAL_Z_3D"),
            Format::Nd => write!(f, "ND"),
        }
    }
}

impl Display for OutputOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputOrder::M => write!(f, "M"),
            OutputOrder::Hw => write!(f, "HW"),
        }
    }
}

impl TensorDesc {
    pub fn new(format: Format, dtype: Dtype) -> Self {
        TensorDesc { format, dtype }
    }
}

impl CubeInfo {
    pub fn mad_size(&self) -> u64 {
        self.mad_dtype.size().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cube_info_per_dtype() {
        let fp32 = Dtype::Float32.cube_info().unwrap();
        assert_eq!((fp32.m0, fp32.k0, fp32.n0), (16, 8, 16));
        let int8 = Dtype::Int8.cube_info().unwrap();
        assert_eq!(int8.k0, 32);
        assert_eq!(int8.mad_dtype, Dtype::Int32);
        assert!(Dtype::Int32.cube_info().is_none());
    }

    proptest! {
        #[test]
        fn test_k0_spans_one_c0_block(dtype in any::<Dtype>()) {
            if let Some(cube) = dtype.cube_info() {
                prop_assert_eq!(cube.k0 * u64::from(dtype.size()), C0_SIZE);
                prop_assert_eq!(cube.mad_size(), 4);
            }
        }
    }
}
