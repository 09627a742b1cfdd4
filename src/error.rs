/// Reasons a convolution cannot be tiled.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TilingError {
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("unsupported dtype combination: {0}")]
    UnsupportedDtype(String),
    #[error("unsupported format combination: {0}")]
    UnsupportedFormat(String),
    #[error("invalid attribute: {0}")]
    InvalidAttr(String),
    #[error("load3d hardware limit exceeded: {0}")]
    HardwareLimitExceeded(String),
    #[error("arithmetic overflow: {0}")]
    ArithmeticOverflow(String),
    #[error("group convolution optimization failed: {0}")]
    GroupConvOptFailed(String),
    #[error("no valid output order: {0}")]
    NoValidOutputOrder(String),
    #[error("no L1 tiling fits: {0}")]
    L1TilingInfeasible(String),
    #[error("no L0 tiling fits: {0}")]
    L0TilingInfeasible(String),
    #[error("platform info not initialized: {0}")]
    PlatformUninitialized(String),
    #[error("tiling payload: {0}")]
    Payload(String),
}

pub const STATUS_SUCCESS: i64 = 0;
pub const STATUS_FAILED: i64 = -1;

/// Collapses a tiling result into the launcher's integer status.
pub fn status_code<T>(result: &Result<T, TilingError>) -> i64 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(_) => STATUS_FAILED,
    }
}

/// Logs `err` and returns it as an `Err`.
pub(crate) fn fail<T>(err: TilingError) -> Result<T, TilingError> {
    log::error!("conv3d tiling failed: {err}");
    Err(err)
}
