//! Exposure Descriptor and the shared state it lives in.
//!
//! There is exactly one [`ExposureDescriptor`] per process. It is owned by
//! [`SharedState`] together with the [`HeaderTable`] and the [`MessageLog`],
//! all behind a single `parking_lot::Mutex`. Every read or write from the RPC
//! side, the worker and the driver goes through [`SharedState::with`] or one of
//! the accessors built on it, so no field is ever touched outside the lock.
//!
//! The lock is never held across an `.await`: accessors take synchronous
//! closures and release the guard when they return.
//!
//! # Signals
//!
//! Besides the lock, the shared state carries:
//!
//! - a start signal the controller raises once an exposure is accepted,
//! - a wake signal that interrupts the worker's poll tick when an abort,
//!   readout or update request arrives,
//! - a broadcast of state transitions for observers.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tracing::Level;

use crate::header::HeaderTable;
use crate::messages::MessageLog;

/// Longest exposure accepted, used for the "maximum" request (10 hours).
pub const EXPTIME_MAX_SECS: u32 = 60 * 60 * 10;

// =============================================================================
// State machine
// =============================================================================

/// Exposure lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExposureState {
    /// Before the driver reported a successful init.
    Unknown,
    /// Idle, accepting a new batch.
    Ready,
    /// Batch accepted; the worker has not opened the shutter yet.
    PrepareExpose,
    /// Shutter open, polling the driver.
    Expose,
    /// Running the end hook after the last frame.
    FinishExpose,
    /// Sensor is being read out.
    Readout,
}

impl ExposureState {
    /// Numeric code shown in `CCDSTATE` replies.
    pub fn code(self) -> u8 {
        match self {
            ExposureState::Unknown => 0,
            ExposureState::Ready => 1,
            ExposureState::PrepareExpose => 2,
            ExposureState::Expose => 3,
            ExposureState::FinishExpose => 4,
            ExposureState::Readout => 5,
        }
    }

    /// Lowercase name used in status replies.
    pub fn as_str(self) -> &'static str {
        match self {
            ExposureState::Unknown => "unknown",
            ExposureState::Ready => "ready",
            ExposureState::PrepareExpose => "prepare expose",
            ExposureState::Expose => "expose",
            ExposureState::FinishExpose => "finish expose",
            ExposureState::Readout => "readout",
        }
    }
}

impl fmt::Display for ExposureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame classification set through the `IMAGETYP` header key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImageType {
    /// Flat field.
    Flat,
    /// Comparison arc.
    Comp,
    /// Bias frame.
    Zero,
    /// Dark frame.
    Dark,
    /// Science frame.
    Object,
}

impl ImageType {
    /// Lowercase `IMAGETYP` value.
    pub fn as_str(self) -> &'static str {
        match self {
            ImageType::Flat => "flat",
            ImageType::Comp => "comp",
            ImageType::Zero => "zero",
            ImageType::Dark => "dark",
            ImageType::Object => "object",
        }
    }

    /// Zero and dark frames keep the shutter closed.
    pub fn uses_shutter(self) -> bool {
        !matches!(self, ImageType::Zero | ImageType::Dark)
    }
}

impl FromStr for ImageType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flat" => Ok(ImageType::Flat),
            "comp" => Ok(ImageType::Comp),
            "zero" => Ok(ImageType::Zero),
            "dark" => Ok(ImageType::Dark),
            "object" => Ok(ImageType::Object),
            _ => Err(()),
        }
    }
}

/// Abort progress. RPC raises `Requested`, the driver poll raises `Acknowledged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortLevel {
    /// No abort pending.
    #[default]
    None,
    /// Raised by an RPC call, not yet seen by the driver.
    Requested,
    /// The driver stopped the exposure.
    Acknowledged,
}

/// Requested exposure length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureTime {
    /// Fixed length, capped at the maximum.
    Seconds(u32),
    /// Longest supported exposure.
    Maximum,
}

impl ExposureTime {
    /// `-1` is the maximum, other negative values are rejected.
    pub fn from_request(value: i64) -> Option<Self> {
        match value {
            -1 => Some(ExposureTime::Maximum),
            v if v >= 0 => Some(ExposureTime::Seconds(u32::try_from(v).unwrap_or(EXPTIME_MAX_SECS))),
            _ => None,
        }
    }

    /// Length in seconds.
    pub fn as_secs(self) -> u32 {
        match self {
            ExposureTime::Seconds(s) => s.min(EXPTIME_MAX_SECS),
            ExposureTime::Maximum => EXPTIME_MAX_SECS,
        }
    }
}

/// Exposure-meter count that ends an exposure early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeterThreshold {
    /// The meter does not end exposures.
    #[default]
    Disabled,
    /// Stop once the meter reaches this count.
    Counts(u64),
}

impl MeterThreshold {
    /// `-1` and `0` disable the meter, anything positive is a count.
    pub fn from_request(value: i64) -> Self {
        match u64::try_from(value) {
            Ok(n) if n > 0 => MeterThreshold::Counts(n),
            _ => MeterThreshold::Disabled,
        }
    }

    /// Value reported back to the caller, `-1` when disabled.
    pub fn as_request(self) -> i64 {
        match self {
            MeterThreshold::Disabled => -1,
            MeterThreshold::Counts(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }
}

/// Pending change to a running exposure's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExptimeUpdate {
    /// New length in seconds.
    Seconds(u32),
    /// Extend to the maximum.
    Maximum,
    /// Stop exposing and read out now.
    ReadoutNow,
}

impl ExptimeUpdate {
    /// `-1` is the maximum, `0` reads out now.
    pub fn from_request(value: i64) -> Option<Self> {
        match value {
            -1 => Some(ExptimeUpdate::Maximum),
            0 => Some(ExptimeUpdate::ReadoutNow),
            v if v > 0 => Some(ExptimeUpdate::Seconds(
                u32::try_from(v).unwrap_or(EXPTIME_MAX_SECS),
            )),
            _ => None,
        }
    }
}

// =============================================================================
// Descriptor
// =============================================================================

/// Sensor region of interest and binning, 1-based inclusive pixel bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    /// First column, 1-based
    pub x1: u32,
    /// Last column, inclusive
    pub x2: u32,
    /// Horizontal binning
    pub xb: u32,
    /// First row, 1-based
    pub y1: u32,
    /// Last row, inclusive
    pub y2: u32,
    /// Vertical binning
    pub yb: u32,
    /// Bits per sensor word
    pub bits_per_pixel: u32,
}

impl Geometry {
    /// Binned width in pixels.
    pub fn width(&self) -> usize {
        ((self.x2 - self.x1 + 1) / self.xb.max(1)) as usize
    }

    /// Binned height in pixels.
    pub fn height(&self) -> usize {
        ((self.y2 - self.y1 + 1) / self.yb.max(1)) as usize
    }

    /// Binned pixels per frame.
    pub fn pixel_count(&self) -> usize {
        self.width() * self.height()
    }

    /// Frame buffer size in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.pixel_count() * (self.bits_per_pixel as usize).div_ceil(8)
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            x1: 1,
            x2: 2048,
            xb: 1,
            y1: 1,
            y2: 2048,
            yb: 1,
            bits_per_pixel: 16,
        }
    }
}

/// The single shared record of the exposure subsystem.
#[derive(Debug, Clone)]
pub struct ExposureDescriptor {
    /// Current lifecycle state.
    pub state: ExposureState,
    /// Unset until a client sends `IMAGETYP`.
    pub image_type: Option<ImageType>,
    /// Shell command run before a batch, chosen with the image type.
    pub begin_hook: Option<String>,
    /// Shell command run after a batch, chosen with the image type.
    pub end_hook: Option<String>,
    /// Length of each frame.
    pub exptime: ExposureTime,
    /// Frames in the batch.
    pub expose_count: u32,
    /// 1-based index of the frame in progress.
    pub expose_number: u32,
    /// Meter count that ends a frame early.
    pub meter_threshold: MeterThreshold,
    /// Staged by `expose_set_time`, applied in the driver poll.
    pub exptime_update: Option<ExptimeUpdate>,
    /// Staged by `expose_set_meter`.
    pub meter_update: Option<MeterThreshold>,
    /// Abort progress of the running frame.
    pub abort: AbortLevel,
    /// Stop exposing and keep the frame.
    pub readout_requested: bool,
    /// Open the shutter for this frame.
    pub shutter: bool,
    /// Seconds elapsed in the current phase.
    pub elapsed_time: u32,
    /// Expected readout duration in seconds.
    pub readout_time: u32,
    /// Region of interest and binning.
    pub geometry: Geometry,
    /// Last sensor temperature in degrees Celsius.
    pub actual_temp: f64,
    /// Temperature setpoint in degrees Celsius.
    pub require_temp: f64,
    /// Last error message, empty when none.
    pub last_error: String,
    /// Output directory.
    pub path: PathBuf,
    /// Archive destination.
    pub archive_path: String,
    /// Archive saved frames.
    pub archive: bool,
    /// Raw sidecar of the current frame.
    pub raw_image: PathBuf,
    /// FITS path of the current frame.
    pub fits_file: PathBuf,
    /// Set when the shutter opens.
    pub start_exposure_time: Option<DateTime<Utc>>,
    /// Set when the shutter closes.
    pub stop_exposure_time: Option<DateTime<Utc>>,
}

impl ExposureDescriptor {
    /// Idle descriptor for `geometry`.
    pub fn new(geometry: Geometry) -> Self {
        Self {
            state: ExposureState::Unknown,
            image_type: None,
            begin_hook: None,
            end_hook: None,
            exptime: ExposureTime::Seconds(0),
            expose_count: 1,
            expose_number: 1,
            meter_threshold: MeterThreshold::Disabled,
            exptime_update: None,
            meter_update: None,
            abort: AbortLevel::None,
            readout_requested: false,
            shutter: true,
            elapsed_time: 0,
            readout_time: 0,
            geometry,
            actual_temp: 0.0,
            require_temp: 0.0,
            last_error: String::new(),
            path: PathBuf::from("/tmp"),
            archive_path: String::new(),
            archive: false,
            raw_image: PathBuf::new(),
            fits_file: PathBuf::new(),
            start_exposure_time: None,
            stop_exposure_time: None,
        }
    }

    /// Reset everything a previous batch may have left behind.
    pub fn clear_transient(&mut self) {
        self.exptime_update = None;
        self.meter_update = None;
        self.abort = AbortLevel::None;
        self.readout_requested = false;
        self.elapsed_time = 0;
    }

    /// Expected total for the current phase: exposure time while exposing,
    /// readout time while reading out, otherwise zero.
    pub fn full_time(&self) -> u32 {
        match self.state {
            ExposureState::Expose => self.exptime.as_secs(),
            ExposureState::Readout => self.readout_time,
            _ => 0,
        }
    }
}

// =============================================================================
// Shared state
// =============================================================================

/// Everything guarded by the process-wide lock.
#[derive(Debug)]
pub struct Shared {
    /// Exposure record.
    pub descriptor: ExposureDescriptor,
    /// FITS header values.
    pub header: HeaderTable,
    /// Operator-facing message history.
    pub messages: MessageLog,
}

impl Shared {
    /// Record a message in the circular log and emit it through tracing.
    pub fn log(&mut self, level: Level, msg: &str) {
        emit(level, msg);
        self.messages.push(Utc::now(), msg);
    }
}

/// Cloneable handle to the shared state.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<Shared>>,
    transitions: broadcast::Sender<ExposureState>,
    start: Arc<Notify>,
    wake: Arc<Notify>,
}

impl SharedState {
    /// Shared state holding `descriptor` and `header`.
    pub fn new(descriptor: ExposureDescriptor, header: HeaderTable) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(Shared {
                descriptor,
                header,
                messages: MessageLog::new(),
            })),
            transitions,
            start: Arc::new(Notify::new()),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Copy of the descriptor at this instant.
    pub fn descriptor(&self) -> ExposureDescriptor {
        self.with(|s| s.descriptor.clone())
    }

    /// Copy of the header table at this instant.
    pub fn header(&self) -> HeaderTable {
        self.with(|s| s.header.clone())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExposureState {
        self.with(|s| s.descriptor.state)
    }

    /// Change the state and broadcast the transition.
    pub fn set_state(&self, state: ExposureState) {
        self.with_transition(|s| s.descriptor.state = state);
    }

    /// Run `f` with the lock held and broadcast any state change it made.
    ///
    /// Used where a state check and the transition must be one atomic step.
    pub fn with_transition<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let (previous, current, result) = {
            let mut guard = self.inner.lock();
            let previous = guard.descriptor.state;
            let result = f(&mut guard);
            (previous, guard.descriptor.state, result)
        };
        if previous != current {
            tracing::debug!(from = %previous, to = %current, "state transition");
            // No subscribers is fine.
            let _ = self.transitions.send(current);
        }
        result
    }

    /// Current abort level.
    pub fn abort_level(&self) -> AbortLevel {
        self.with(|s| s.descriptor.abort)
    }

    /// Observe state transitions from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExposureState> {
        self.transitions.subscribe()
    }

    /// Record a message at `level`.
    pub fn log(&self, level: Level, msg: &str) {
        self.with(|s| s.log(level, msg));
    }

    /// Record an informational message.
    pub fn info(&self, msg: &str) {
        self.log(Level::INFO, msg);
    }

    /// Record a warning.
    pub fn warn(&self, msg: &str) {
        self.log(Level::WARN, msg);
    }

    /// Record an error and remember it as the last error.
    pub fn error(&self, msg: &str) {
        self.with(|s| {
            s.descriptor.last_error = msg.to_string();
            s.log(Level::ERROR, msg);
        });
    }

    pub(crate) fn start_signal(&self) -> &Notify {
        &self.start
    }

    pub(crate) fn wake_signal(&self) -> &Notify {
        &self.wake
    }
}

fn emit(level: Level, msg: &str) {
    match level {
        Level::ERROR => tracing::error!("{msg}"),
        Level::WARN => tracing::warn!("{msg}"),
        Level::INFO => tracing::info!("{msg}"),
        Level::DEBUG => tracing::debug!("{msg}"),
        Level::TRACE => tracing::trace!("{msg}"),
    }
}
