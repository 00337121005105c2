//! Exposure Controller
//!
//! The controller is the only entry point the RPC surface talks to. Every
//! operation takes the shared lock for the field reads and writes it needs,
//! releases it, and only then calls into the driver, so a slow driver call
//! never blocks status queries.
//!
//! ## Replies
//!
//! User-level outcomes are reply strings: `+OK ...` on success and
//! `-ERR ...` when a request is refused. Only protocol problems, such as a
//! malformed argument or starting an exposure without an image type, are
//! returned as [`RpcError`] faults.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ExposedConfig;
use crate::driver::CcdDriver;
use crate::error::RpcError;
use crate::header::{HeaderKey, HeaderTable};
use crate::state::{
    AbortLevel, ExposureDescriptor, ExposureState, ExposureTime, ExptimeUpdate, ImageType,
    MeterThreshold, SharedState,
};

/// Lowest accepted `CCDTEMP` setpoint, in degrees Celsius.
pub const TEMP_MIN: f64 = -150.0;
/// Highest accepted `CCDTEMP` setpoint.
pub const TEMP_MAX: f64 = -90.0;

/// Snapshot returned by `expose_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureInfo {
    /// Current `.fit` base name, empty before the first frame.
    pub filename: String,
    /// Lowercase state name.
    pub state: String,
    /// Seconds elapsed in the current phase.
    pub elapsed_time: u32,
    /// Exposure plus readout time, in seconds.
    pub full_time: u32,
    /// `1` when frames are archived.
    pub archive: u8,
    /// Output directory.
    pub path: String,
    /// Archive destination.
    pub archive_path: String,
    /// Allowed output directories, `:`-separated.
    pub paths: String,
    /// Allowed archive destinations, `:`-separated.
    pub archive_paths: String,
    /// Sensor temperature in degrees Celsius.
    pub ccd_temp: f64,
    /// Frames in the batch.
    pub expose_count: u32,
    /// 1-based frame in progress.
    pub expose_number: u32,
    /// Configured instrument name.
    pub instrument: String,
}

/// Build the shared state the daemon starts with.
pub fn initial_state(config: &ExposedConfig) -> SharedState {
    let mut descriptor = ExposureDescriptor::new(config.ccd.geometry());
    descriptor.path = config.default_output_path();
    descriptor.archive_path = config.default_archive_path();
    descriptor.archive = config.exposed.archive;
    descriptor.require_temp = config.ccd.temperature;
    descriptor.readout_time = config.ccd.readout_time;

    let mut header = HeaderTable::new();
    for (name, value) in &config.header {
        if let Some(key) = HeaderKey::from_name(name) {
            header.set_value(key, value);
        }
    }

    SharedState::new(descriptor, header)
}

/// Operations behind the RPC surface.
#[derive(Clone)]
pub struct Controller {
    shared: SharedState,
    driver: Arc<dyn CcdDriver>,
    config: Arc<ExposedConfig>,
}

impl Controller {
    /// Controller over the daemon's shared state and camera.
    pub fn new(shared: SharedState, driver: Arc<dyn CcdDriver>, config: Arc<ExposedConfig>) -> Self {
        Self {
            shared,
            driver,
            config,
        }
    }

    /// Shared exposure state.
    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    /// Camera backend.
    pub fn driver(&self) -> &Arc<dyn CcdDriver> {
        &self.driver
    }

    /// Effective configuration.
    pub fn config(&self) -> &ExposedConfig {
        &self.config
    }

    // =========================================================================
    // Variables
    // =========================================================================

    /// `SET` a daemon variable such as `CCDTEMP` or `PATH`.
    pub async fn set_variable(&self, name: &str, value: &str) -> String {
        debug!(name, value, "expose_set");
        match name {
            "PATH" => {
                if !is_dir_rwxu(value).await {
                    return format!("-ERR {value} is forbidden path");
                }
                self.shared.with(|s| s.descriptor.path = value.into());
                "+OK".to_string()
            }
            "ARCHIVEPATH" => {
                if !is_dir_rwxu(value).await {
                    return format!("-ERR {value} is forbidden path");
                }
                self.shared.with(|s| s.descriptor.archive_path = value.to_string());
                "+OK".to_string()
            }
            "ARCHIVE" => {
                let archive = match value.chars().next() {
                    Some('0') => false,
                    Some('1') => true,
                    _ => return format!("-ERR {value} is unknown value"),
                };
                self.shared.with(|s| s.descriptor.archive = archive);
                "+OK".to_string()
            }
            "CCDTEMP" => {
                let temp = value.trim().parse::<f64>().unwrap_or(0.0);
                if !(TEMP_MIN..=TEMP_MAX).contains(&temp) {
                    return format!(
                        "-ERR temperature {temp:.2} is out of range ({TEMP_MIN:.1}, {TEMP_MAX:.1})"
                    );
                }
                match self.driver.set_temp(temp).await {
                    Ok(()) => {
                        self.shared.info(&format!("CCD temperature set to {temp:.1}"));
                        "+OK".to_string()
                    }
                    Err(e) => format!("-ERR {e}"),
                }
            }
            "READOUT_SPEED" => match self.driver.set_readout_speed(value).await {
                Ok(()) => "+OK".to_string(),
                Err(_) => format!("-ERR {value} is unknown value"),
            },
            "GAIN" => match self.driver.set_gain(value).await {
                Ok(()) => "+OK".to_string(),
                Err(_) => format!("-ERR {value} is unknown value"),
            },
            _ => format!("-ERR {name} is unknown variable"),
        }
    }

    /// `GET` a daemon variable. Unknown names are an `-ERR` reply.
    pub async fn get_variable(&self, name: &str) -> String {
        match name {
            "PATH" => {
                let path = self.shared.with(|s| s.descriptor.path.clone());
                format!("+OK PATH = {}", path.display())
            }
            "ARCHIVEPATH" => {
                let path = self.shared.with(|s| s.descriptor.archive_path.clone());
                format!("+OK ARCHIVEPATH = {path}")
            }
            "PATHS" => format!("+OK PATHS = {}", self.output_paths()),
            "ARCHIVEPATHS" => format!("+OK ARCHIVEPATHS = {}", self.archive_paths()),
            "ARCHIVE" => {
                let archive = self.shared.with(|s| s.descriptor.archive);
                format!("+OK ARCHIVE = {}", u8::from(archive))
            }
            "CCDTEMP" => {
                let temp = self.shared.with(|s| s.descriptor.actual_temp);
                format!("+OK CCDTEMP = {temp:.1}")
            }
            "CCDSTATE" => self.shared.with(|s| ccd_state(&s.descriptor, &s.header)),
            "INSTRUMENT" => format!("+OK INSTRUMENT = {}", self.config.exposed.instrument),
            "READOUT_SPEED" => format!("+OK READOUT_SPEED = {}", self.driver.readout_speed()),
            "READOUT_SPEEDS" => {
                format!("+OK READOUT_SPEEDS = {}", self.driver.readout_speeds().join(" "))
            }
            "GAIN" => format!("+OK GAIN = {}", self.driver.gain()),
            "GAINS" => format!("+OK GAINS = {}", self.driver.gains().join(" ")),
            _ if name.starts_with("MESSAGE") => {
                let count = name
                    .split_once(' ')
                    .and_then(|(_, n)| n.trim().parse::<usize>().ok());
                self.shared.with(|s| s.messages.render_last(count))
            }
            _ => format!("-ERR {name} is unknown variable"),
        }
    }

    // =========================================================================
    // Header keys
    // =========================================================================

    /// Set a header key, validating `IMAGETYP` and `OBJECT`.
    pub fn set_header_key(&self, name: &str, value: &str, comment: &str) -> String {
        let Some(key) = HeaderKey::from_name(name) else {
            return format!("-ERR {name} is unknown key");
        };
        if value.is_empty() {
            return "-ERR unknown value".to_string();
        }

        if key == HeaderKey::Imagetyp {
            let Ok(image_type) = value.parse::<ImageType>() else {
                return format!("-ERR {value} is not supported imagetype");
            };
            let begin = self.config.hooks.begin.for_image_type(image_type).map(str::to_string);
            let end = self.config.hooks.end.for_image_type(image_type).map(str::to_string);
            return self.shared.with(|s| {
                s.descriptor.image_type = Some(image_type);
                s.descriptor.shutter = image_type.uses_shutter();
                s.descriptor.begin_hook = begin;
                s.descriptor.end_hook = end;
                s.header.set(key, value, comment);
                format!("+OK {}", s.header.render(key))
            });
        }

        self.shared.with(|s| {
            s.header.set(key, value, comment);
            format!("+OK {}", s.header.render(key))
        })
    }

    /// `KEY = value / comment` for one key.
    pub fn get_header_key(&self, name: &str) -> String {
        match HeaderKey::from_name(name) {
            Some(key) => self.shared.with(|s| format!("+OK {}", s.header.render(key))),
            None => format!("-ERR {name} is unknown key"),
        }
    }

    /// Every header key, one per line.
    pub fn get_all_header_keys(&self) -> String {
        self.shared.with(|s| s.header.render_all())
    }

    // =========================================================================
    // Exposure control
    // =========================================================================

    /// Accept a new batch if the camera is idle and wake the worker.
    pub fn start_exposure(&self, exptime: i64, count: i64, threshold: i64) -> Result<String, RpcError> {
        let exptime = ExposureTime::from_request(exptime)
            .ok_or_else(|| RpcError::Malformed(format!("exposure time {exptime} is invalid")))?;
        let count = u32::try_from(count).ok().filter(|&c| c > 0).unwrap_or(1);
        let threshold = MeterThreshold::from_request(threshold);

        let reply = self.shared.with_transition(|s| {
            let d = &mut s.descriptor;
            if d.state != ExposureState::Ready {
                return Ok("-ERR expose already running".to_string());
            }
            if d.image_type.is_none() {
                return Err(RpcError::Precondition("must execute SETKEY IMAGETYP".to_string()));
            }

            d.clear_transient();
            d.last_error.clear();
            d.exptime = exptime;
            d.expose_count = count;
            d.expose_number = 0;
            d.meter_threshold = threshold;
            d.state = ExposureState::PrepareExpose;

            let reply = format!(
                "+OK EXPOSE {} {} {}",
                exptime.as_secs(),
                count,
                threshold.as_request()
            );
            s.log(tracing::Level::INFO, &reply);
            Ok(reply)
        })?;

        if reply.starts_with("+OK") {
            info!(exptime = exptime.as_secs(), count, "exposure accepted");
            self.shared.start_signal().notify_one();
        }
        Ok(reply)
    }

    /// Ask the running exposure to stop and read out now.
    pub fn request_readout(&self) -> String {
        self.shared.with(|s| s.descriptor.readout_requested = true);
        self.shared.wake_signal().notify_one();
        "+OK".to_string()
    }

    /// Raise the abort level. Idempotent.
    pub fn request_abort(&self) -> String {
        self.shared.with(|s| {
            if s.descriptor.abort == AbortLevel::None {
                s.descriptor.abort = AbortLevel::Requested;
                s.log(tracing::Level::INFO, "abort requested");
            }
        });
        self.shared.wake_signal().notify_one();
        "+OK".to_string()
    }

    /// Stage a new exposure time, applied on the next driver poll.
    pub fn update_exptime(&self, value: i64) -> Result<String, RpcError> {
        let update = ExptimeUpdate::from_request(value)
            .ok_or_else(|| RpcError::Malformed(format!("exposure time {value} is invalid")))?;
        self.shared.with(|s| s.descriptor.exptime_update = Some(update));
        self.shared.wake_signal().notify_one();
        Ok("+OK".to_string())
    }

    /// Stage a new meter threshold. `0` leaves it unchanged.
    pub fn update_meter(&self, value: i64) -> String {
        if value != 0 {
            let threshold = MeterThreshold::from_request(value);
            self.shared.with(|s| s.descriptor.meter_update = Some(threshold));
            self.shared.wake_signal().notify_one();
        }
        "+OK".to_string()
    }

    /// Deprecated, accepted and ignored.
    pub fn add_time(&self, _seconds: i64) -> String {
        "+OK".to_string()
    }

    /// Snapshot for `expose_info`.
    pub fn status(&self) -> ExposureInfo {
        let paths = self.output_paths();
        let archive_paths = self.archive_paths();
        let instrument = self.config.exposed.instrument.to_string();
        self.shared.with(|s| {
            let d = &s.descriptor;
            ExposureInfo {
                filename: s.header.value(HeaderKey::Filename).to_string(),
                state: d.state.as_str().to_string(),
                elapsed_time: d.elapsed_time,
                full_time: d.full_time(),
                archive: u8::from(d.archive),
                path: d.path.display().to_string(),
                archive_path: d.archive_path.clone(),
                paths,
                archive_paths,
                ccd_temp: d.actual_temp,
                expose_count: d.expose_count,
                expose_number: d.expose_number,
                instrument,
            }
        })
    }

    fn output_paths(&self) -> String {
        self.config
            .paths
            .output
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn archive_paths(&self) -> String {
        self.config.paths.archive.join(" ")
    }
}

/// `CCDSTATE` reply for the current state.
fn ccd_state(d: &ExposureDescriptor, header: &HeaderTable) -> String {
    let code = d.state.code();
    let file = header.value(HeaderKey::Filename);
    match d.state {
        ExposureState::Unknown => "-ERR".to_string(),
        ExposureState::Ready => format!("+OK {code} ccd is ready '{file}'"),
        ExposureState::PrepareExpose => format!("+OK {code} preparing expose '{file}'"),
        ExposureState::Expose => format!(
            "+OK {code} exposing {} {} '{file}'",
            d.elapsed_time,
            d.exptime.as_secs()
        ),
        ExposureState::FinishExpose => format!("+OK {code} finishing expose '{file}'"),
        ExposureState::Readout => format!(
            "+OK {code} reading out CCD {} {} '{file}'",
            d.elapsed_time, d.readout_time
        ),
    }
}

/// Directory that exists and is readable, writable and searchable by its owner.
async fn is_dir_rwxu(path: impl AsRef<Path>) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_dir() && meta.permissions().mode() & 0o700 == 0o700,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverContext, DummyCcd};
    use tempfile::{tempdir, TempDir};

    async fn controller() -> (TempDir, Controller) {
        let dir = tempdir().unwrap();
        let toml = format!(
            r#"
            [exposed]
            instrument = "CCD700"
            instrument_prefix = "c"

            [paths]
            output = ["{}", "/tmp"]
            archive = ["pleione:/archive"]

            [hooks.begin]
            flat = "lamp on"
            [hooks.end]
            flat = "lamp off"

            [header]
            OBSERVAT = "ONDREJOV"
            "#,
            dir.path().display()
        );
        let config = Arc::new(ExposedConfig::from_toml_str(&toml).unwrap());
        let shared = initial_state(&config);
        let driver: Arc<dyn CcdDriver> = Arc::new(DummyCcd::new(DriverContext::new(shared.clone())));
        driver.init().await.unwrap();
        (dir, Controller::new(shared, driver, config))
    }

    #[tokio::test]
    async fn test_initial_state_from_config() {
        let (dir, ctl) = controller().await;
        let d = ctl.shared().descriptor();
        assert_eq!(d.path, dir.path());
        assert_eq!(d.archive_path, "pleione:/archive");
        assert_eq!(d.require_temp, -110.0);
        assert_eq!(ctl.get_header_key("OBSERVAT"), "+OK OBSERVAT = ONDREJOV / Name of observatory (IRAF style)");
    }

    #[tokio::test]
    async fn test_path_variables() {
        let (dir, ctl) = controller().await;
        let sub = dir.path().join("night");
        std::fs::create_dir(&sub).unwrap();

        let value = sub.display().to_string();
        assert_eq!(ctl.set_variable("PATH", &value).await, "+OK");
        assert_eq!(ctl.get_variable("PATH").await, format!("+OK PATH = {value}"));

        let missing = dir.path().join("nope").display().to_string();
        assert_eq!(
            ctl.set_variable("PATH", &missing).await,
            format!("-ERR {missing} is forbidden path")
        );
        assert_eq!(ctl.get_variable("PATH").await, format!("+OK PATH = {value}"));

        assert_eq!(
            ctl.get_variable("PATHS").await,
            format!("+OK PATHS = {} /tmp", dir.path().display())
        );
        assert_eq!(ctl.get_variable("ARCHIVEPATHS").await, "+OK ARCHIVEPATHS = pleione:/archive");
    }

    #[tokio::test]
    async fn test_archive_toggle() {
        let (_dir, ctl) = controller().await;
        assert_eq!(ctl.get_variable("ARCHIVE").await, "+OK ARCHIVE = 0");
        assert_eq!(ctl.set_variable("ARCHIVE", "1").await, "+OK");
        assert_eq!(ctl.get_variable("ARCHIVE").await, "+OK ARCHIVE = 1");
        assert_eq!(ctl.set_variable("ARCHIVE", "yes").await, "-ERR yes is unknown value");
    }

    #[tokio::test]
    async fn test_temperature_range() {
        let (_dir, ctl) = controller().await;
        assert_eq!(
            ctl.set_variable("CCDTEMP", "-80").await,
            "-ERR temperature -80.00 is out of range (-150.0, -90.0)"
        );
        assert_eq!(ctl.get_variable("CCDTEMP").await, "+OK CCDTEMP = -100.5");

        assert_eq!(ctl.set_variable("CCDTEMP", "-120").await, "+OK");
        assert_eq!(ctl.get_variable("CCDTEMP").await, "+OK CCDTEMP = -120.0");
    }

    #[tokio::test]
    async fn test_driver_variables() {
        let (_dir, ctl) = controller().await;
        assert_eq!(ctl.get_variable("READOUT_SPEEDS").await, "+OK READOUT_SPEEDS = dummy");
        assert_eq!(ctl.set_variable("READOUT_SPEED", "dummy").await, "+OK");
        assert_eq!(ctl.set_variable("GAIN", "max").await, "-ERR max is unknown value");
        assert_eq!(ctl.get_variable("GAIN").await, "+OK GAIN = default");
        assert_eq!(ctl.get_variable("INSTRUMENT").await, "+OK INSTRUMENT = CCD700");
    }

    #[tokio::test]
    async fn test_unknown_variable() {
        let (_dir, ctl) = controller().await;
        assert_eq!(ctl.set_variable("SPEED", "1").await, "-ERR SPEED is unknown variable");
        assert_eq!(ctl.get_variable("SPEED").await, "-ERR SPEED is unknown variable");
    }

    #[tokio::test]
    async fn test_ccdstate_and_messages() {
        let (_dir, ctl) = controller().await;
        assert_eq!(ctl.get_variable("CCDSTATE").await, "+OK 1 ccd is ready ''");

        ctl.shared().info("first");
        ctl.shared().info("second");
        let all = ctl.get_variable("MESSAGE").await;
        assert!(all.contains("first") && all.ends_with("+OK"));
        let last = ctl.get_variable("MESSAGE 1").await;
        assert!(!last.contains("first"));
        assert!(last.contains("second"));
    }

    #[tokio::test]
    async fn test_header_key_errors() {
        let (_dir, ctl) = controller().await;
        let before = ctl.get_all_header_keys();

        assert_eq!(ctl.set_header_key("NOSUCH", "x", ""), "-ERR NOSUCH is unknown key");
        assert_eq!(ctl.set_header_key("OBJECT", "", ""), "-ERR unknown value");
        assert_eq!(ctl.get_header_key("NOSUCH"), "-ERR NOSUCH is unknown key");
        assert_eq!(ctl.get_all_header_keys(), before);
    }

    #[tokio::test]
    async fn test_header_key_comment_kept() {
        let (_dir, ctl) = controller().await;
        assert_eq!(
            ctl.set_header_key("OBJECT", "Vega", ""),
            "+OK OBJECT = Vega / Title of observation"
        );
        assert_eq!(
            ctl.set_header_key("OBJECT", "Deneb", "target"),
            "+OK OBJECT = Deneb / target"
        );
    }

    #[tokio::test]
    async fn test_image_type_selects_hooks() {
        let (_dir, ctl) = controller().await;
        assert!(ctl.set_header_key("IMAGETYP", "flat", "").starts_with("+OK IMAGETYP = flat"));
        let d = ctl.shared().descriptor();
        assert_eq!(d.image_type, Some(ImageType::Flat));
        assert!(d.shutter);
        assert_eq!(d.begin_hook.as_deref(), Some("lamp on"));
        assert_eq!(d.end_hook.as_deref(), Some("lamp off"));

        assert_eq!(
            ctl.set_header_key("IMAGETYP", "bias", ""),
            "-ERR bias is not supported imagetype"
        );
        let d = ctl.shared().descriptor();
        assert_eq!(d.image_type, Some(ImageType::Flat));
        assert_eq!(d.begin_hook.as_deref(), Some("lamp on"));
        assert_eq!(ctl.shared().header().value(HeaderKey::Imagetyp), "flat");

        ctl.set_header_key("IMAGETYP", "DARK", "");
        let d = ctl.shared().descriptor();
        assert!(!d.shutter);
        assert_eq!(d.begin_hook, None);
    }

    #[tokio::test]
    async fn test_start_requires_image_type() {
        let (_dir, ctl) = controller().await;
        let err = ctl.start_exposure(5, 1, -1).unwrap_err();
        assert_eq!(err.to_string(), "must execute SETKEY IMAGETYP");
        assert_eq!(ctl.shared().state(), ExposureState::Ready);
    }

    #[tokio::test]
    async fn test_start_normalises_request() {
        let (_dir, ctl) = controller().await;
        ctl.set_header_key("IMAGETYP", "object", "");

        let reply = ctl.start_exposure(-1, 0, -1).unwrap();
        assert_eq!(reply, "+OK EXPOSE 36000 1 -1");
        let d = ctl.shared().descriptor();
        assert_eq!(d.state, ExposureState::PrepareExpose);
        assert_eq!(d.exptime, ExposureTime::Maximum);
        assert_eq!(d.expose_count, 1);
        assert_eq!(d.meter_threshold, MeterThreshold::Disabled);
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let (_dir, ctl) = controller().await;
        ctl.set_header_key("IMAGETYP", "object", "");
        ctl.start_exposure(5, 2, 1000).unwrap();
        ctl.shared().set_state(ExposureState::Expose);
        let before = ctl.shared().descriptor();

        let reply = ctl.start_exposure(10, 3, -1).unwrap();
        assert_eq!(reply, "-ERR expose already running");

        let after = ctl.shared().descriptor();
        assert_eq!(after.state, ExposureState::Expose);
        assert_eq!(after.exptime, before.exptime);
        assert_eq!(after.expose_count, 2);
        assert_eq!(after.meter_threshold, MeterThreshold::Counts(1000));
    }

    #[tokio::test]
    async fn test_start_rejects_bad_exptime() {
        let (_dir, ctl) = controller().await;
        ctl.set_header_key("IMAGETYP", "object", "");
        assert!(matches!(ctl.start_exposure(-5, 1, -1), Err(RpcError::Malformed(_))));
        assert_eq!(ctl.shared().state(), ExposureState::Ready);
    }

    #[tokio::test]
    async fn test_abort_is_raised_once() {
        let (_dir, ctl) = controller().await;
        assert_eq!(ctl.request_abort(), "+OK");
        assert_eq!(ctl.shared().abort_level(), AbortLevel::Requested);

        ctl.shared().with(|s| s.descriptor.abort = AbortLevel::Acknowledged);
        ctl.request_abort();
        assert_eq!(ctl.shared().abort_level(), AbortLevel::Acknowledged);
    }

    #[tokio::test]
    async fn test_updates_are_staged() {
        let (_dir, ctl) = controller().await;
        assert_eq!(ctl.update_exptime(0).unwrap(), "+OK");
        assert_eq!(ctl.shared().descriptor().exptime_update, Some(ExptimeUpdate::ReadoutNow));
        assert!(ctl.update_exptime(-3).is_err());

        assert_eq!(ctl.update_meter(0), "+OK");
        assert_eq!(ctl.shared().descriptor().meter_update, None);
        ctl.update_meter(-1);
        assert_eq!(ctl.shared().descriptor().meter_update, Some(MeterThreshold::Disabled));
        ctl.update_meter(250);
        assert_eq!(ctl.shared().descriptor().meter_update, Some(MeterThreshold::Counts(250)));

        assert_eq!(ctl.request_readout(), "+OK");
        assert!(ctl.shared().descriptor().readout_requested);
        assert_eq!(ctl.add_time(30), "+OK");
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (dir, ctl) = controller().await;
        ctl.shared().with(|s| {
            s.descriptor.state = ExposureState::Readout;
            s.descriptor.readout_time = 43;
            s.descriptor.elapsed_time = 7;
            s.header.set_value(HeaderKey::Filename, "c202401010001.fit");
        });

        let info = ctl.status();
        assert_eq!(info.filename, "c202401010001.fit");
        assert_eq!(info.state, "readout");
        assert_eq!(info.full_time, 43);
        assert_eq!(info.elapsed_time, 7);
        assert_eq!(info.path, dir.path().display().to_string());
        assert_eq!(info.ccd_temp, -100.5);
        assert_eq!(info.instrument, "CCD700");
        assert_eq!(
            ctl.get_variable("CCDSTATE").await,
            "+OK 5 reading out CCD 7 43 'c202401010001.fit'"
        );
    }
}
