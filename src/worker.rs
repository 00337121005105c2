//! Worker / Exposure Loop
//!
//! A single task, spawned at startup, runs every exposure batch from start to
//! finish. While idle it waits for the controller's start signal and refreshes
//! the sensor temperature every [`TEMP_INTERVAL`].
//!
//! During a frame the driver's `expose()` and `readout()` are polled every
//! [`POLL_INTERVAL`]. An abort, early-readout or update request wakes the poll
//! early, but the request itself is only acted on inside the driver's poll, so
//! cancellation stays cooperative.
//!
//! ```text
//! READY -> PREPARE_EXPOSE -> (EXPOSE -> READOUT)* -> FINISH_EXPOSE -> READY
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ExposedConfig;
use crate::driver::CcdDriver;
use crate::header::{HeaderKey, HeaderTable};
use crate::hooks;
use crate::naming::{allocate_frame, frame_prefix, FrameNames};
use crate::peers::{apply_spectrograph, apply_telescope, ExposureMeter, Peers};
use crate::persist;
use crate::state::{AbortLevel, ExposureState, MeterThreshold, SharedState};

/// Interval between `expose()` / `readout()` polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between temperature refreshes, idle or exposing.
pub const TEMP_INTERVAL: Duration = Duration::from_secs(15);

/// How a single frame ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOutcome {
    Saved,
    /// Read out, but writing the files failed.
    Failed,
    Aborted,
    /// `expose_init` or `expose_start` failed; the batch stops.
    HardwareFailure,
}

/// The exposure task.
pub struct Worker {
    shared: SharedState,
    driver: Arc<dyn CcdDriver>,
    peers: Peers,
    meter: ExposureMeter,
    config: Arc<ExposedConfig>,
}

/// Handle to the spawned worker task.
pub struct WorkerHandle {
    task: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    /// Stop the worker once any running batch has ended and wait for it to
    /// exit. Callers abort the batch first.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                debug!("worker already stopped");
            }
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "worker task ended abnormally");
        }
    }
}

impl Worker {
    /// Worker over the daemon's shared state, driving `driver`.
    pub fn new(
        shared: SharedState,
        driver: Arc<dyn CcdDriver>,
        peers: Peers,
        config: Arc<ExposedConfig>,
    ) -> Self {
        let meter = ExposureMeter::new(peers.spectrograph.clone(), config.exposed.instrument);
        Self {
            shared,
            driver,
            peers,
            meter,
            config,
        }
    }

    /// Start the task.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            task,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        info!("exposure worker started");
        loop {
            self.refresh_temp().await;

            tokio::select! {
                _ = self.shared.start_signal().notified() => {
                    if self.shared.state() == ExposureState::PrepareExpose {
                        self.run_batch().await;
                    } else {
                        debug!("start signal without a pending exposure");
                    }
                }
                _ = tokio::time::sleep(TEMP_INTERVAL) => {}
                _ = &mut shutdown_rx => {
                    info!("exposure worker received shutdown signal");
                    break;
                }
            }
        }
        info!("exposure worker stopped");
    }

    /// Expose every frame of the accepted batch.
    async fn run_batch(&self) {
        let (count, begin_hook, end_hook) = self.shared.with(|s| {
            let d = &s.descriptor;
            (d.expose_count, d.begin_hook.clone(), d.end_hook.clone())
        });

        let prefix = frame_prefix(self.config.instrument_prefix(), Local::now().naive_local());
        if let Some(command) = begin_hook {
            hooks::run_shell("begin", &command).await;
        }

        for index in 0..count {
            let dir = self.shared.with(|s| {
                s.descriptor.expose_number = index + 1;
                s.descriptor.path.clone()
            });

            let Some(frame) = allocate_frame(&dir, &prefix) else {
                self.shared.error(&format!(
                    "Error: no free file name for prefix {prefix} in {}",
                    dir.display()
                ));
                break;
            };

            let outcome = self.run_frame(&frame).await;
            debug!(?outcome, frame = frame.number, "frame finished");
            if outcome == FrameOutcome::HardwareFailure {
                break;
            }

            // Any abort, even one raised during readout, ends the batch.
            let stop = self.shared.with(|s| {
                s.descriptor.abort != AbortLevel::None || s.descriptor.readout_requested
            });
            if stop {
                break;
            }
        }

        self.shared.set_state(ExposureState::FinishExpose);
        if let Some(command) = end_hook {
            hooks::run_shell("end", &command).await;
        }
        self.shared.set_state(ExposureState::Ready);
        self.shared.info("ccd is ready");
    }

    async fn run_frame(&self, frame: &FrameNames) -> FrameOutcome {
        let basename = frame.fits_basename();
        self.shared.with(|s| {
            s.descriptor.raw_image = frame.raw.clone();
            s.descriptor.fits_file = frame.fits.clone();
            s.descriptor.elapsed_time = 0;
            s.header.set_value(HeaderKey::Filename, &basename);
        });

        let outcome = self.expose_frame(frame).await;

        if let Err(e) = self.driver.expose_uninit().await {
            self.shared.error(&format!("Error: expose_uninit(): {e}"));
        }
        outcome
    }

    async fn expose_frame(&self, frame: &FrameNames) -> FrameOutcome {
        if let Err(e) = self.driver.expose_init().await {
            self.shared.error(&format!("Error: expose_init(): {e}"));
            return FrameOutcome::HardwareFailure;
        }
        if let Err(e) = self.driver.expose_start().await {
            self.shared.error(&format!("Error: expose_start(): {e}"));
            return FrameOutcome::HardwareFailure;
        }

        self.frame_start().await;

        self.shared.info("expose begin");
        self.shared.set_state(ExposureState::Expose);
        let mut last_temp = Instant::now();
        while self.driver.expose().await {
            if last_temp.elapsed() >= TEMP_INTERVAL {
                last_temp = Instant::now();
                self.refresh_temp().await;
            }
            if self.meter_reached().await {
                self.shared.with(|s| s.descriptor.readout_requested = true);
            }
            self.tick().await;
        }
        self.shared.info("expose end");

        if self.shared.abort_level() == AbortLevel::Acknowledged {
            self.meter.finish().await;
            self.shared.warn(&format!("exposure of {} aborted", frame.fits_basename()));
            return FrameOutcome::Aborted;
        }

        self.frame_end().await;
        if let Err(e) = self.driver.expose_end().await {
            self.shared.warn(&format!("Warning: expose_end(): {e}"));
        }

        self.shared.info("readout begin");
        self.shared.with(|s| s.descriptor.elapsed_time = 0);
        self.shared.set_state(ExposureState::Readout);
        while self.driver.readout().await {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        self.shared.info("readout end");

        let script = self.config.exposed.archive_script.as_deref();
        match persist::save_image(&self.shared, self.driver.as_ref(), frame, script).await {
            Ok(bytes) => {
                info!(file = %frame.fits.display(), bytes, "frame saved");
                FrameOutcome::Saved
            }
            Err(e) => {
                self.shared.error(&format!("Error: save image {}: {e}", frame.fits.display()));
                FrameOutcome::Failed
            }
        }
    }

    /// Sleep one poll interval, waking early on a control request.
    async fn tick(&self) {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = self.shared.wake_signal().notified() => {}
        }
    }

    async fn refresh_temp(&self) {
        match self.driver.get_temp().await {
            Ok(temp) => debug!(temp, "ccd temperature"),
            Err(e) => self.shared.warn(&format!("Error: get_temp(): {e}")),
        }
    }

    /// Apply a staged threshold update and compare the meter against it.
    async fn meter_reached(&self) -> bool {
        let threshold = self.shared.with(|s| {
            let d = &mut s.descriptor;
            if let Some(update) = d.meter_update.take() {
                d.meter_threshold = update;
            }
            d.meter_threshold
        });

        let MeterThreshold::Counts(limit) = threshold else {
            return false;
        };
        match self.meter.counts().await {
            Some(counts) if counts >= limit => {
                self.shared.info(&format!(
                    "actual expval = {counts}, required expval = {limit}"
                ));
                true
            }
            _ => false,
        }
    }

    /// Timing, driver and peer header fields at the start of a frame.
    async fn frame_start(&self) {
        let now = Utc::now();
        let sysver = format!("EXPOSED {}.{}", env!("CARGO_PKG_VERSION"), self.driver.version());
        let speed = self.driver.readout_speed();
        let gain = self.driver.gain();

        self.shared.with(|s| {
            s.descriptor.start_exposure_time = Some(now);
            let h = &mut s.header;
            set_time_of_day(h, HeaderKey::TmStart, now);
            h.set_value(HeaderKey::Ut, now.format("%H:%M:%S").to_string());
            h.set_value(HeaderKey::Epoch, "2000.0");
            h.set_value(HeaderKey::Equinox, "2000.0");
            h.set_value(HeaderKey::DateObs, now.format("%Y-%m-%d").to_string());
            h.set_value(HeaderKey::Readspd, &speed);
            h.set_value(HeaderKey::Gainm, &gain);
            h.set_value(HeaderKey::Sysver, &sysver);
        });

        match self.peers.telescope.telescope_info().await {
            Ok(info) => self.shared.with(|s| apply_telescope(&mut s.header, &info, now)),
            Err(e) => warn!(error = %e, "telescope header not updated"),
        }
        match self.peers.spectrograph.spectrograph_info().await {
            Ok(info) => {
                let instrument = self.config.exposed.instrument;
                self.shared.with(|s| apply_spectrograph(&mut s.header, &info, instrument));
            }
            Err(e) => warn!(error = %e, "spectrograph header not updated"),
        }

        self.meter.start().await;
    }

    /// Timing, meter and temperature header fields once exposing stopped.
    async fn frame_end(&self) {
        let expval = self.meter.finish().await;
        let now = Utc::now();

        self.shared.with(|s| {
            s.descriptor.stop_exposure_time = Some(now);
            let exptime = s
                .descriptor
                .start_exposure_time
                .map_or(0, |start| (now - start).num_seconds().max(0));
            let temp = s.descriptor.actual_temp;

            let h = &mut s.header;
            if let Some(expval) = expval {
                h.set_value(HeaderKey::Expval, format!("{expval:.6}"));
            }
            set_time_of_day(h, HeaderKey::TmEnd, now);
            h.set_value(HeaderKey::Exptime, exptime.to_string());
            h.set_value(HeaderKey::Darktime, exptime.to_string());
            h.set_value(HeaderKey::Ccdtemp, format!("{temp:.1}"));
        });
    }
}

/// Seconds since UTC midnight, with `HH:MM:SS, <unix time>` as the comment.
fn set_time_of_day(header: &mut HeaderTable, key: HeaderKey, at: DateTime<Utc>) {
    header.set_value(key, at.num_seconds_from_midnight().to_string());
    header.set_comment(
        key,
        format!("{}, {}", at.format("%H:%M:%S"), at.timestamp()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_of_day_card() {
        let mut header = HeaderTable::new();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 1, 2, 3).unwrap();
        set_time_of_day(&mut header, HeaderKey::TmStart, at);
        assert_eq!(header.value(HeaderKey::TmStart), "3723");
        assert_eq!(
            header.get(HeaderKey::TmStart).comment,
            format!("01:02:03, {}", at.timestamp())
        );
    }
}
