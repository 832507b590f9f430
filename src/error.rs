//! Error taxonomy for the colorimetric calibration core
//!
//! Mirrors the failure kinds a caller of the external interface (§6) can
//! observe. Hardware-layer kinds are reported but never fatal to the
//! process; the core degrades and keeps going. Numerics and storage
//! failures never mutate the active calibration.

use thiserror::Error;

/// Domain error returned by core operations.
///
/// Every variant carries a human-readable message in addition to its
/// kind so transport layers can surface something meaningful without
/// re-deriving context from the enum discriminant alone.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("sensor not initialized: {0}")]
    SensorNotInitialized(String),

    #[error("I2C read failed: {0}")]
    I2cReadFailed(String),

    #[error("auto-zero sequence failed: {0}")]
    AutoZeroFailed(String),

    #[error("saturation detected: {0}")]
    SaturationDetected(String),

    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error("insufficient calibration data: {0}")]
    InsufficientData(String),

    #[error("calibration quality too low: {0}")]
    QualityTooLow(String),

    #[error("persistent storage failed: {0}")]
    StorageFailed(String),
}

impl CoreError {
    /// Stable tag matching the taxonomy names in §7, for transport-layer
    /// serialization independent of the Display message.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::SensorNotInitialized(_) => "SENSOR_NOT_INITIALIZED",
            CoreError::I2cReadFailed(_) => "I2C_READ_FAILED",
            CoreError::AutoZeroFailed(_) => "AUTO_ZERO_FAILED",
            CoreError::SaturationDetected(_) => "SATURATION_DETECTED",
            CoreError::InvalidMatrix(_) => "INVALID_MATRIX",
            CoreError::InsufficientData(_) => "INSUFFICIENT_DATA",
            CoreError::QualityTooLow(_) => "QUALITY_TOO_LOW",
            CoreError::StorageFailed(_) => "STORAGE_FAILED",
        }
    }

    /// Whether this kind is hardware-layer and non-fatal to the process
    /// (§7: the core degrades rather than aborting the operation chain).
    pub fn is_hardware_transient(&self) -> bool {
        matches!(
            self,
            CoreError::SensorNotInitialized(_)
                | CoreError::I2cReadFailed(_)
                | CoreError::AutoZeroFailed(_)
                | CoreError::SaturationDetected(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_taxonomy_tag() {
        assert_eq!(
            CoreError::InsufficientData("need 4".into()).kind(),
            "INSUFFICIENT_DATA"
        );
        assert_eq!(
            CoreError::StorageFailed("disk full".into()).kind(),
            "STORAGE_FAILED"
        );
    }

    #[test]
    fn hardware_kinds_are_transient() {
        assert!(CoreError::I2cReadFailed("timeout".into()).is_hardware_transient());
        assert!(!CoreError::InvalidMatrix("singular".into()).is_hardware_transient());
    }
}
