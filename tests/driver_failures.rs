//! Batches against a camera backend that fails on demand.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use tempfile::{tempdir, TempDir};
use tokio_test::assert_ok;

use ccd_exposed::config::ExposedConfig;
use ccd_exposed::driver::{CcdDriver, DriverContext, DriverResult, DummyCcd};
use ccd_exposed::error::DriverError;
use ccd_exposed::fits::FitsImage;
use ccd_exposed::naming::{frame_prefix, MAX_FRAME_NUMBER};
use ccd_exposed::peers::Peers;
use ccd_exposed::state::{ExposureState, SharedState};
use ccd_exposed::Daemon;

/// Which entry points fail.
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    expose_start: bool,
    first_save: bool,
}

#[derive(Debug, Default)]
struct Calls {
    expose_init: usize,
    expose_uninit: usize,
    save_fits: usize,
}

/// Simulated camera with scripted failures and call counts.
struct ScriptedCcd {
    inner: DummyCcd,
    faults: Faults,
    calls: Arc<Mutex<Calls>>,
}

#[async_trait]
impl CcdDriver for ScriptedCcd {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn init(&self) -> DriverResult<()> {
        self.inner.init().await
    }

    async fn uninit(&self) -> DriverResult<()> {
        self.inner.uninit().await
    }

    async fn expose_init(&self) -> DriverResult<()> {
        self.calls.lock().expose_init += 1;
        self.inner.expose_init().await
    }

    async fn expose_start(&self) -> DriverResult<()> {
        if self.faults.expose_start {
            return Err(DriverError::Hardware("shutter stuck".to_string()));
        }
        self.inner.expose_start().await
    }

    async fn expose(&self) -> bool {
        self.inner.expose().await
    }

    async fn expose_end(&self) -> DriverResult<()> {
        self.inner.expose_end().await
    }

    async fn readout(&self) -> bool {
        self.inner.readout().await
    }

    async fn save_raw_image(&self, path: &Path) -> DriverResult<()> {
        self.inner.save_raw_image(path).await
    }

    async fn save_fits_file(&self, image: &mut FitsImage) -> DriverResult<()> {
        let attempt = {
            let mut calls = self.calls.lock();
            calls.save_fits += 1;
            calls.save_fits
        };
        if self.faults.first_save && attempt == 1 {
            return Err(DriverError::Hardware("pixel transfer lost".to_string()));
        }
        self.inner.save_fits_file(image).await
    }

    async fn expose_uninit(&self) -> DriverResult<()> {
        self.calls.lock().expose_uninit += 1;
        self.inner.expose_uninit().await
    }

    async fn get_temp(&self) -> DriverResult<f64> {
        self.inner.get_temp().await
    }

    async fn set_temp(&self, celsius: f64) -> DriverResult<()> {
        self.inner.set_temp(celsius).await
    }

    fn readout_speed(&self) -> String {
        self.inner.readout_speed()
    }

    fn readout_speeds(&self) -> Vec<String> {
        self.inner.readout_speeds()
    }

    async fn set_readout_speed(&self, speed: &str) -> DriverResult<()> {
        self.inner.set_readout_speed(speed).await
    }

    fn gain(&self) -> String {
        self.inner.gain()
    }

    fn gains(&self) -> Vec<String> {
        self.inner.gains()
    }

    async fn set_gain(&self, gain: &str) -> DriverResult<()> {
        self.inner.set_gain(gain).await
    }

    fn version(&self) -> String {
        self.inner.version()
    }
}

fn config(dir: &Path, readout_time: u32) -> ExposedConfig {
    let toml = format!(
        r#"
        [exposed]
        instrument = "CCD700"
        instrument_prefix = "c"
        listen = "127.0.0.1:0"

        [paths]
        output = ["{}"]

        [ccd]
        readout_time = {readout_time}
        x2 = 32
        y2 = 16
        "#,
        dir.display()
    );
    ExposedConfig::from_toml_str(&toml).expect("test config")
}

async fn start_scripted(
    dir: &TempDir,
    readout_time: u32,
    faults: Faults,
) -> (Daemon, Arc<Mutex<Calls>>) {
    let calls = Arc::new(Mutex::new(Calls::default()));
    let counted = Arc::clone(&calls);
    let daemon = Daemon::start_with_driver(
        config(dir.path(), readout_time),
        Peers::offline(),
        move |ctx: DriverContext| {
            let driver: Arc<dyn CcdDriver> = Arc::new(ScriptedCcd {
                inner: DummyCcd::new(ctx),
                faults,
                calls: counted,
            });
            Ok(driver)
        },
    )
    .await
    .unwrap();
    daemon.controller().set_header_key("IMAGETYP", "object", "");
    (daemon, calls)
}

async fn wait_for(shared: &SharedState, state: ExposureState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while shared.state() != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {state}, still {}",
            shared.state()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == ext))
        .collect();
    files.sort();
    files
}

fn file_names(files: &[PathBuf]) -> Vec<String> {
    files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn test_hardware_failure_stops_batch() {
    let dir = tempdir().unwrap();
    let faults = Faults {
        expose_start: true,
        ..Faults::default()
    };
    let (daemon, calls) = start_scripted(&dir, 0, faults).await;
    let ctl = daemon.controller().clone();

    assert_ok!(ctl.start_exposure(0, 3, -1));
    wait_for(ctl.shared(), ExposureState::Ready).await;

    {
        let calls = calls.lock();
        assert_eq!(calls.expose_init, 1);
        assert_eq!(calls.expose_uninit, 1);
        assert_eq!(calls.save_fits, 0);
    }
    let descriptor = ctl.shared().descriptor();
    assert_eq!(descriptor.expose_number, 1);
    assert!(descriptor.last_error.contains("expose_start"));
    assert!(descriptor.last_error.contains("shutter stuck"));
    assert!(files_with_extension(dir.path(), "fit").is_empty());
    assert!(ctl.shared().with(|s| s.messages.render_last(None).contains("ccd is ready")));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_failed_save_moves_on_to_next_frame() {
    let dir = tempdir().unwrap();
    let faults = Faults {
        first_save: true,
        ..Faults::default()
    };
    let (daemon, calls) = start_scripted(&dir, 0, faults).await;
    let ctl = daemon.controller().clone();

    assert_ok!(ctl.start_exposure(0, 2, -1));
    wait_for(ctl.shared(), ExposureState::Ready).await;

    {
        let calls = calls.lock();
        assert_eq!(calls.expose_init, 2);
        assert_eq!(calls.expose_uninit, 2);
        assert_eq!(calls.save_fits, 2);
    }
    assert!(ctl.shared().descriptor().last_error.contains("pixel transfer lost"));

    // The first frame keeps only its raw sidecar; the second saved normally.
    let images = file_names(&files_with_extension(dir.path(), "fit"));
    assert_eq!(images.len(), 1);
    assert!(images[0].ends_with("0002.fit"));
    let raws = file_names(&files_with_extension(dir.path(), "raw"));
    assert_eq!(raws.len(), 1);
    assert!(raws[0].ends_with("0001.raw"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_sequence_numbers_end_batch() {
    let dir = tempdir().unwrap();
    let (daemon, calls) = start_scripted(&dir, 0, Faults::default()).await;
    let ctl = daemon.controller().clone();

    let prefix = frame_prefix('c', Local::now().naive_local());
    for number in 1..=MAX_FRAME_NUMBER {
        std::fs::write(dir.path().join(format!("{prefix}{number:04}.fit")), b"").unwrap();
    }

    assert_ok!(ctl.start_exposure(0, 1, -1));
    wait_for(ctl.shared(), ExposureState::Ready).await;

    assert_eq!(calls.lock().expose_init, 0);
    assert!(ctl.shared().descriptor().last_error.contains("no free file name"));
    assert_eq!(
        files_with_extension(dir.path(), "fit").len(),
        MAX_FRAME_NUMBER as usize
    );
    assert!(files_with_extension(dir.path(), "raw").is_empty());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_aborted_frame_is_released() {
    let dir = tempdir().unwrap();
    let (daemon, calls) = start_scripted(&dir, 0, Faults::default()).await;
    let ctl = daemon.controller().clone();

    assert_ok!(ctl.start_exposure(30, 1, -1));
    wait_for(ctl.shared(), ExposureState::Expose).await;
    ctl.request_abort();
    wait_for(ctl.shared(), ExposureState::Ready).await;

    let calls = calls.lock();
    assert_eq!(calls.expose_init, 1);
    assert_eq!(calls.expose_uninit, 1);
    assert_eq!(calls.save_fits, 0);
    drop(calls);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_abort_during_readout_keeps_frame_and_ends_batch() {
    let dir = tempdir().unwrap();
    let (daemon, calls) = start_scripted(&dir, 2, Faults::default()).await;
    let ctl = daemon.controller().clone();

    assert_ok!(ctl.start_exposure(0, 3, -1));
    wait_for(ctl.shared(), ExposureState::Readout).await;
    ctl.request_abort();
    wait_for(ctl.shared(), ExposureState::Ready).await;

    // The frame already being read out is saved, the rest never start.
    assert_eq!(calls.lock().expose_init, 1);
    assert_eq!(ctl.shared().descriptor().expose_number, 1);
    let images = file_names(&files_with_extension(dir.path(), "fit"));
    assert_eq!(images.len(), 1);
    assert!(images[0].ends_with("0001.fit"));

    daemon.shutdown().await;
}
