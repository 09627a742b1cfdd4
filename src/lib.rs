pub mod blockdim;
pub mod common;
pub mod engine;
pub mod error;
pub mod group;
pub mod order;
pub mod shape;
pub mod target;
pub mod tiling;
pub mod tilingdata;
pub mod utils;
pub mod validate;

pub use engine::Conv3dTilingEngine;
pub use error::{status_code, TilingError};
pub use tiling::Conv3dTiling;
