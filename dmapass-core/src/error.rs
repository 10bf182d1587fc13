//! Error types for dmapass.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for dmapass operations.
pub type Result<T> = std::result::Result<T, DmaPassError>;

/// Main error type for dmapass.
#[derive(Error, Debug)]
pub enum DmaPassError {
    // Resource access
    #[error("Failed to open {path:?}: {source}")]
    OpenFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // VFIO protocol errors
    #[error("VFIO protocol mismatch: {reason}")]
    ProtocolMismatch { reason: String },

    #[error("VFIO group {group:?} is not viable (not all devices bound to vfio-pci)")]
    Unviable { group: PathBuf },

    #[error("Failed to attach group {group:?} to container: {reason}")]
    AttachFailure { group: PathBuf, reason: String },

    #[error("Failed to enable IOMMU model: {reason}")]
    IommuFailure { reason: String },

    #[error("DMA mapping of {size:#x} bytes at IOVA {iova:#x} failed: {reason}")]
    DmaMapFailure { iova: u64, size: u64, reason: String },

    #[error("Device {device} failed: {reason}")]
    DeviceFailure { device: String, reason: String },

    // Buffer provider errors
    #[error("Failed to allocate {len:#x}-byte coherent buffer: {reason}")]
    AllocationFailure { len: usize, reason: String },

    #[error("Failed to install mapping: {reason}")]
    MapFailure { reason: String },

    // Memory source errors
    #[error("{strategy} memory acquisition failed: {reason}")]
    AcquisitionFailure { strategy: String, reason: String },

    // Operator gate
    #[error("Aborted: {reason}")]
    Aborted { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DmaPassError {
    /// Build a `DeviceFailure` from an OS error.
    pub fn device(device: &str, err: impl std::fmt::Display) -> Self {
        Self::DeviceFailure { device: device.to_string(), reason: err.to_string() }
    }

    /// Build an `AcquisitionFailure` for the given strategy.
    pub fn acquisition(strategy: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Self::AcquisitionFailure { strategy: strategy.to_string(), reason: reason.to_string() }
    }
}
