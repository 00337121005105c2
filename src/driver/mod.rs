//! CCD Driver Interface
//!
//! Every camera backend implements [`CcdDriver`]. The daemon binds exactly one
//! driver at startup through [`resolve_driver`], keyed on the `driver.name`
//! configuration value, and keeps it for the life of the process.
//!
//! # Contract
//!
//! The worker calls the entry points in this order for every frame:
//!
//! ```text
//! expose_init -> expose_start -> expose* -> [expose_end -> readout* -> save_raw_image
//!             -> save_fits_file] -> expose_uninit
//! ```
//!
//! `expose()` and `readout()` are polled roughly every 100 ms and return `true`
//! while the phase is still in progress. The bracketed part is skipped when
//! the frame was aborted.
//!
//! # Shared State
//!
//! Drivers never see the Exposure Descriptor. They receive a [`DriverContext`]
//! at construction and use its lock-guarded helpers to publish temperature,
//! elapsed time and state, and to consume pending abort, readout and
//! exposure-time requests while polling.

pub mod dummy;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::fits::FitsImage;
use crate::state::{AbortLevel, ExposureState, ExposureTime, ExptimeUpdate, Geometry, SharedState};

pub use dummy::DummyCcd;

/// Result type for driver entry points.
pub type DriverResult<T> = Result<T, DriverError>;

/// Capability contract of a camera backend.
#[async_trait]
pub trait CcdDriver: Send + Sync {
    /// Module name, as used in the configuration.
    fn name(&self) -> &'static str;

    /// Open the hardware. On success the driver moves the state to READY.
    async fn init(&self) -> DriverResult<()>;

    /// Release the hardware.
    async fn uninit(&self) -> DriverResult<()>;

    /// Validate geometry, allocate the frame buffer and program speed, gain,
    /// shutter mode and temperature setpoint.
    async fn expose_init(&self) -> DriverResult<()>;

    /// Arm the hardware and start the exposure timer.
    async fn expose_start(&self) -> DriverResult<()>;

    /// Poll a running exposure. Returns `true` while still exposing.
    async fn expose(&self) -> bool;

    /// Close the shutter and capture the pixels.
    async fn expose_end(&self) -> DriverResult<()>;

    /// Poll the readout. Returns `true` while still reading.
    async fn readout(&self) -> bool;

    /// Write the sensor words to the raw sidecar.
    async fn save_raw_image(&self, path: &Path) -> DriverResult<()>;

    /// Write the pixel array into an image that already has its header.
    async fn save_fits_file(&self, image: &mut FitsImage) -> DriverResult<()>;

    /// Release per-frame resources. Called after every frame.
    async fn expose_uninit(&self) -> DriverResult<()>;

    /// Read the sensor temperature and publish it.
    async fn get_temp(&self) -> DriverResult<f64>;

    /// Program a new temperature setpoint. Only valid while READY.
    async fn set_temp(&self, celsius: f64) -> DriverResult<()>;

    /// Active readout speed.
    fn readout_speed(&self) -> String;

    /// Readout speeds the backend offers.
    fn readout_speeds(&self) -> Vec<String>;

    /// Select a readout speed by name.
    async fn set_readout_speed(&self, speed: &str) -> DriverResult<()>;

    /// Active gain mode.
    fn gain(&self) -> String;

    /// Gain modes the backend offers.
    fn gains(&self) -> Vec<String>;

    /// Select a gain mode by name.
    async fn set_gain(&self, gain: &str) -> DriverResult<()>;

    /// Backend version, recorded in `SYSVER`.
    fn version(&self) -> String;
}

/// Parameters a driver needs to set up one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureSetup {
    /// Region of interest and binning.
    pub geometry: Geometry,
    /// Open the shutter during the exposure.
    pub shutter: bool,
    /// Temperature setpoint in degrees Celsius.
    pub require_temp: f64,
    /// Expected readout duration in seconds.
    pub readout_time: u32,
}

/// Lock-guarded access to the shared state for drivers.
#[derive(Clone)]
pub struct DriverContext {
    shared: SharedState,
}

impl DriverContext {
    /// Context over `shared`.
    pub fn new(shared: SharedState) -> Self {
        Self { shared }
    }

    /// Current exposure state.
    pub fn state(&self) -> ExposureState {
        self.shared.state()
    }

    /// Move to `state`. Drivers use this to report READY after init.
    pub fn set_state(&self, state: ExposureState) {
        self.shared.set_state(state);
    }

    /// Last published sensor temperature.
    pub fn actual_temp(&self) -> f64 {
        self.shared.with(|s| s.descriptor.actual_temp)
    }

    /// Publish a sensor temperature in degrees Celsius.
    pub fn set_actual_temp(&self, celsius: f64) {
        self.shared.with(|s| s.descriptor.actual_temp = celsius);
    }

    /// Record a new temperature setpoint.
    pub fn set_require_temp(&self, celsius: f64) {
        self.shared.with(|s| s.descriptor.require_temp = celsius);
    }

    /// Seconds elapsed in the current phase.
    pub fn set_elapsed(&self, seconds: u32) {
        self.shared.with(|s| s.descriptor.elapsed_time = seconds);
    }

    /// Override the expected readout duration.
    pub fn set_readout_time(&self, seconds: u32) {
        self.shared.with(|s| s.descriptor.readout_time = seconds);
    }

    /// Record a hardware error message.
    pub fn set_error(&self, msg: &str) {
        self.shared.error(msg);
    }

    /// Snapshot of the setup for the next frame.
    pub fn setup(&self) -> ExposureSetup {
        self.shared.with(|s| ExposureSetup {
            geometry: s.descriptor.geometry,
            shutter: s.descriptor.shutter,
            require_temp: s.descriptor.require_temp,
            readout_time: s.descriptor.readout_time,
        })
    }

    /// Readout duration currently expected.
    pub fn readout_time(&self) -> u32 {
        self.shared.with(|s| s.descriptor.readout_time)
    }

    /// One poll of a running exposure, `elapsed` seconds after it started.
    ///
    /// Applies a pending exposure-time update, acknowledges a requested
    /// abort, honours an early-readout request and publishes the elapsed
    /// time. Returns `true` while the exposure should continue.
    pub fn poll_exposure(&self, elapsed: u32) -> bool {
        self.shared.with(|s| {
            let d = &mut s.descriptor;
            match d.exptime_update.take() {
                Some(ExptimeUpdate::Maximum) => d.exptime = ExposureTime::Maximum,
                Some(ExptimeUpdate::Seconds(secs)) => d.exptime = ExposureTime::Seconds(secs),
                Some(ExptimeUpdate::ReadoutNow) => d.readout_requested = true,
                None => {}
            }

            if d.abort != AbortLevel::None {
                d.abort = AbortLevel::Acknowledged;
                return false;
            }
            if d.readout_requested {
                return false;
            }

            d.elapsed_time = elapsed;
            elapsed < d.exptime.as_secs()
        })
    }
}

/// Bind the driver named in the configuration.
///
/// Unknown names are a fatal startup error. The daemon never runs without a
/// complete driver.
pub fn resolve_driver(name: &str, ctx: DriverContext) -> DriverResult<Arc<dyn CcdDriver>> {
    match name {
        "dummy" => Ok(Arc::new(DummyCcd::new(ctx))),
        other => Err(DriverError::Resolution(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderTable;
    use crate::state::ExposureDescriptor;

    fn context() -> (SharedState, DriverContext) {
        let shared = SharedState::new(ExposureDescriptor::new(Geometry::default()), HeaderTable::new());
        (shared.clone(), DriverContext::new(shared))
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let (_, ctx) = context();
        let driver = resolve_driver("dummy", ctx.clone()).unwrap();
        assert_eq!(driver.name(), "dummy");

        let err = resolve_driver("gandalf", ctx).err().unwrap();
        assert!(matches!(err, DriverError::Resolution(ref n) if n == "gandalf"));
    }

    #[test]
    fn test_poll_counts_elapsed() {
        let (shared, ctx) = context();
        shared.with(|s| s.descriptor.exptime = ExposureTime::Seconds(5));

        assert!(ctx.poll_exposure(0));
        assert!(ctx.poll_exposure(4));
        assert_eq!(shared.descriptor().elapsed_time, 4);
        assert!(!ctx.poll_exposure(5));
    }

    #[test]
    fn test_poll_acknowledges_abort() {
        let (shared, ctx) = context();
        shared.with(|s| {
            s.descriptor.exptime = ExposureTime::Seconds(60);
            s.descriptor.abort = AbortLevel::Requested;
        });

        assert!(!ctx.poll_exposure(1));
        assert_eq!(shared.abort_level(), AbortLevel::Acknowledged);
    }

    #[test]
    fn test_poll_applies_updates() {
        let (shared, ctx) = context();
        shared.with(|s| {
            s.descriptor.exptime = ExposureTime::Seconds(10);
            s.descriptor.exptime_update = Some(ExptimeUpdate::Seconds(3));
        });
        assert!(!ctx.poll_exposure(3));
        assert_eq!(shared.descriptor().exptime, ExposureTime::Seconds(3));
        assert_eq!(shared.descriptor().exptime_update, None);

        shared.with(|s| s.descriptor.exptime_update = Some(ExptimeUpdate::Maximum));
        assert!(ctx.poll_exposure(3));
        assert_eq!(shared.descriptor().exptime, ExposureTime::Maximum);

        shared.with(|s| s.descriptor.exptime_update = Some(ExptimeUpdate::ReadoutNow));
        assert!(!ctx.poll_exposure(4));
        assert!(shared.descriptor().readout_requested);
    }
}
