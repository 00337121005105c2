//! Custom error types for the exposure daemon.
//!
//! This module defines the primary error type, `ExposedError`, together with the
//! per-layer enums it consolidates. Using the `thiserror` crate, it provides a
//! centralized and consistent way to handle the different kinds of failures the
//! daemon can run into, from configuration problems at startup to hardware and
//! file system failures during an exposure.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: loading or validating the configuration. Fatal at startup.
//! - **`Driver`**: camera backend failures, including resolution of the driver
//!   module named in the configuration (fatal at startup) and hardware errors
//!   raised during an exposure (logged, the batch may stop).
//! - **`Persist`**: writing the raw sidecar or the FITS image. Logged, the frame
//!   is marked failed and the batch continues with the next frame.
//! - **`Rpc`**: protocol-level problems such as a caller outside the allow-list
//!   or malformed arguments. These surface as remote-call faults.
//!
//! Rejections that are part of the command protocol (for example starting an
//! exposure while one is already running) are not errors. They are returned to
//! the caller as `-ERR ...` result strings by the controller.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ExposedError>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum ExposedError {
    /// Loading or validating the configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The camera backend failed.
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Writing a frame failed.
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    /// A remote call could not be served.
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Socket or file I/O failed at startup.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not load or merge the sources.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is out of range or inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Errors raised by a CCD driver or while resolving one.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No driver is registered under this name.
    #[error("unknown CCD driver module '{0}'")]
    Resolution(String),

    /// The camera reported an error.
    #[error("{0}")]
    Hardware(String),

    /// The operation needs the READY state.
    #[error("ccd not ready")]
    NotReady,

    /// Speed or gain name the backend does not offer.
    #[error("{0} is unknown value")]
    UnknownValue(String),

    /// Frame buffer I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver could not fill a FITS image.
    #[error("FITS error: {0}")]
    Fits(#[from] FitsError),
}

/// Errors produced by the FITS writer.
#[derive(Debug, Error)]
pub enum FitsError {
    /// Writing the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The target file already exists.
    #[error("file {0} already exists")]
    Exists(PathBuf),

    /// Keyword longer than 8 characters or not ASCII.
    #[error("invalid keyword '{0}'")]
    InvalidKeyword(String),

    /// Pixel buffer does not match the image size.
    #[error("pixel count mismatch: expected {expected}, got {actual}")]
    PixelCount { expected: usize, actual: usize },

    /// No pixel data was written before close.
    #[error("pixel data was never written")]
    MissingData,
}

/// Errors raised while saving a frame to disk.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Building or closing the image failed.
    #[error("FITS error: {0}")]
    Fits(#[from] FitsError),

    /// The driver rejected the pixel transfer.
    #[error("driver failed to write pixels: {0}")]
    Driver(#[from] DriverError),

    /// Sidecar or archive I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the telescope and spectrograph peer services.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The named peer is not connected.
    #[error("{0} service is not available")]
    Unavailable(&'static str),

    /// The peer answered something unparseable.
    #[error("unexpected answer: {0}")]
    Protocol(String),
}

/// Remote-call faults.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Caller address is not on the allow list.
    #[error("Connection from {0} denied")]
    PermissionDenied(String),

    /// Bad parameters or undecodable body.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// No such method on the RPC surface.
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    /// Request is valid but the daemon state forbids it.
    #[error("{0}")]
    Precondition(String),

    /// Length prefix over the frame limit.
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Numeric fault code sent to the caller.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::PermissionDenied(_) => 1,
            RpcError::Malformed(_) | RpcError::FrameTooLarge(_) => 2,
            RpcError::UnknownMethod(_) => 3,
            RpcError::Precondition(_) => 4,
            RpcError::Io(_) => 5,
        }
    }
}
