//! Simulated camera backend.
//!
//! Exposure and readout are purely time based. The frame is a synthetic bias
//! level plus a gradient when the shutter is open, which is enough for the
//! rest of the daemon to produce real files.

use std::path::Path;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{CcdDriver, DriverContext, DriverResult};
use crate::error::DriverError;
use crate::fits::FitsImage;
use crate::state::ExposureState;

/// Temperature the simulated sensor reports after init.
pub const DUMMY_TEMPERATURE: f64 = -100.5;

const BIAS_LEVEL: u16 = 1000;
const READOUT_SPEED: &str = "dummy";
const GAIN: &str = "default";

#[derive(Debug, Default)]
struct Frame {
    started: Option<Instant>,
    stopped: Option<Instant>,
    width: usize,
    height: usize,
    shutter: bool,
    pixels: Vec<u16>,
}

/// Time-based mock camera.
pub struct DummyCcd {
    ctx: DriverContext,
    frame: Mutex<Frame>,
}

impl DummyCcd {
    /// An idle camera bound to the daemon state through `ctx`.
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            frame: Mutex::new(Frame::default()),
        }
    }
}

#[async_trait]
impl CcdDriver for DummyCcd {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn init(&self) -> DriverResult<()> {
        self.ctx.set_actual_temp(DUMMY_TEMPERATURE);
        self.ctx.set_state(ExposureState::Ready);
        Ok(())
    }

    async fn uninit(&self) -> DriverResult<()> {
        *self.frame.lock() = Frame::default();
        Ok(())
    }

    async fn expose_init(&self) -> DriverResult<()> {
        let setup = self.ctx.setup();
        let (width, height) = (setup.geometry.width(), setup.geometry.height());
        if width == 0 || height == 0 {
            let msg = format!("Error: invalid frame size {width}x{height}");
            self.ctx.set_error(&msg);
            return Err(DriverError::Hardware(msg));
        }

        let mut frame = self.frame.lock();
        *frame = Frame {
            width,
            height,
            shutter: setup.shutter,
            pixels: vec![0; width * height],
            ..Frame::default()
        };
        debug!(width, height, shutter = setup.shutter, "dummy frame allocated");
        Ok(())
    }

    async fn expose_start(&self) -> DriverResult<()> {
        self.frame.lock().started = Some(Instant::now());
        Ok(())
    }

    async fn expose(&self) -> bool {
        let started = self.frame.lock().started;
        let Some(started) = started else {
            return false;
        };
        let elapsed = u32::try_from(started.elapsed().as_secs()).unwrap_or(u32::MAX);
        self.ctx.poll_exposure(elapsed)
    }

    async fn expose_end(&self) -> DriverResult<()> {
        let mut frame = self.frame.lock();
        frame.stopped = Some(Instant::now());

        let frame = &mut *frame;
        let (width, height, shutter) = (frame.width, frame.height, frame.shutter);
        for (y, row) in frame.pixels.chunks_mut(width.max(1)).take(height).enumerate() {
            for (x, pixel) in row.iter_mut().enumerate() {
                let signal = if shutter { ((x + y) % 256) as u16 } else { 0 };
                *pixel = BIAS_LEVEL + signal;
            }
        }
        Ok(())
    }

    async fn readout(&self) -> bool {
        let stopped = self.frame.lock().stopped;
        let Some(stopped) = stopped else {
            return false;
        };
        let elapsed = u32::try_from(stopped.elapsed().as_secs()).unwrap_or(u32::MAX);
        self.ctx.set_elapsed(elapsed);
        elapsed < self.ctx.readout_time()
    }

    async fn save_raw_image(&self, path: &Path) -> DriverResult<()> {
        let raw = {
            let frame = self.frame.lock();
            let mut raw = BytesMut::with_capacity(frame.pixels.len() * 2);
            for &pixel in &frame.pixels {
                raw.put_u16(pixel);
            }
            raw.freeze()
        };
        tokio::fs::write(path, &raw).await?;
        Ok(())
    }

    async fn save_fits_file(&self, image: &mut FitsImage) -> DriverResult<()> {
        let frame = self.frame.lock();
        image.write_pixels(&frame.pixels)?;
        Ok(())
    }

    async fn expose_uninit(&self) -> DriverResult<()> {
        *self.frame.lock() = Frame::default();
        Ok(())
    }

    async fn get_temp(&self) -> DriverResult<f64> {
        Ok(self.ctx.actual_temp())
    }

    async fn set_temp(&self, celsius: f64) -> DriverResult<()> {
        if self.ctx.state() != ExposureState::Ready {
            return Err(DriverError::NotReady);
        }
        self.ctx.set_require_temp(celsius);
        self.ctx.set_actual_temp(celsius);
        Ok(())
    }

    fn readout_speed(&self) -> String {
        READOUT_SPEED.to_string()
    }

    fn readout_speeds(&self) -> Vec<String> {
        vec![READOUT_SPEED.to_string()]
    }

    async fn set_readout_speed(&self, speed: &str) -> DriverResult<()> {
        if speed == READOUT_SPEED {
            Ok(())
        } else {
            Err(DriverError::UnknownValue(speed.to_string()))
        }
    }

    fn gain(&self) -> String {
        GAIN.to_string()
    }

    fn gains(&self) -> Vec<String> {
        vec![GAIN.to_string()]
    }

    async fn set_gain(&self, gain: &str) -> DriverResult<()> {
        if gain == GAIN {
            Ok(())
        } else {
            Err(DriverError::UnknownValue(gain.to_string()))
        }
    }

    fn version(&self) -> String {
        format!("dummy-{}", env!("CARGO_PKG_VERSION"))
    }
}
