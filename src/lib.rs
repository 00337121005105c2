//! Core library for the CCD exposure daemon.
//!
//! The daemon owns a single camera. Remote clients configure exposures,
//! populate FITS header keys and start, abort or shorten exposure batches over
//! a length-prefixed JSON RPC surface. One worker task runs every batch, polls
//! the camera driver, collects telescope and spectrograph metadata and writes
//! each frame as a FITS image.
//!
//! - [`controller`]: validation and replies behind every remote call
//! - [`worker`]: the exposure state machine
//! - [`driver`]: camera backend seam and the simulated backend
//! - [`persist`] and [`fits`]: image files
//! - [`rpc`] and [`server`]: wire surface
//! - [`daemon`]: startup and shutdown

pub mod config;
pub mod controller;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod fits;
pub mod header;
pub mod hooks;
pub mod messages;
pub mod naming;
pub mod peers;
pub mod persist;
pub mod rpc;
pub mod server;
pub mod state;
pub mod worker;

pub use config::ExposedConfig;
pub use daemon::Daemon;
pub use error::{AppResult, ExposedError};
