//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the exposure
//! daemon. Configuration is loaded from:
//! 1. a TOML file (default `/etc/exposed.toml`)
//! 2. Environment variables (prefixed with `EXPOSED_`)
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `EXPOSED_` prefix override configuration
//! values. Nested tables are separated with a double underscore so that keys
//! containing `_` survive:
//!
//! ```text
//! EXPOSED_EXPOSED__LISTEN=0.0.0.0:5001
//! EXPOSED_DRIVER__NAME=dummy
//! EXPOSED_CCD__READOUT_TIME=43
//! ```
//!
//! # Example
//!
//! ```toml
//! [exposed]
//! instrument = "CCD700"
//! instrument_prefix = "c"
//! allowed_ips = ["127.0.0.1"]
//!
//! [driver]
//! name = "dummy"
//!
//! [paths]
//! output = ["/data/ccd700"]
//! archive = ["pleione:/archive/ccd700"]
//!
//! [hooks.begin]
//! flat = "/usr/local/bin/flat_lamp on"
//!
//! [header]
//! OBSERVAT = "ONDREJOV"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::header::HeaderKey;
use crate::state::{Geometry, ImageType};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/exposed.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposedConfig {
    /// Daemon identity, network and archive settings
    pub exposed: DaemonConfig,
    /// Camera backend selection
    #[serde(default)]
    pub driver: DriverConfig,
    /// Output and archive directories
    pub paths: PathsConfig,
    /// Per-image-type shell hooks
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Sensor geometry and thermal defaults
    #[serde(default)]
    pub ccd: CcdConfig,
    /// Static FITS header values, keyed by keyword
    #[serde(default)]
    pub header: BTreeMap<String, String>,
}

/// Spectrograph line the camera is mounted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instrument {
    /// Ondřejov 2 m coudé, 700 mm camera.
    #[serde(rename = "CCD700")]
    Ccd700,
    /// Ondřejov 2 m coudé, 400 mm camera.
    #[serde(rename = "CCD400")]
    Ccd400,
    /// Ondřejov Echelle Spectrograph.
    #[serde(rename = "OES")]
    Oes,
}

impl Instrument {
    /// Name used in the configuration and in `INSTRUMENT` replies.
    pub fn as_str(self) -> &'static str {
        match self {
            Instrument::Ccd700 => "CCD700",
            Instrument::Ccd400 => "CCD400",
            Instrument::Oes => "OES",
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daemon-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Spectrograph line, selects header defaults and meter ids
    pub instrument: Instrument,
    /// Single letter that starts every frame filename
    pub instrument_prefix: String,
    /// Exact-match list of client addresses
    #[serde(default = "default_allowed_ips")]
    pub allowed_ips: Vec<String>,
    /// Address the RPC server binds to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Written at startup, removed on shutdown
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Archive frames after they are written
    #[serde(default)]
    pub archive: bool,
    /// Command run with the saved file name when archiving
    #[serde(default)]
    pub archive_script: Option<String>,
}

/// Driver selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Backend module, currently only `dummy`
    #[serde(default = "default_driver")]
    pub name: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: default_driver(),
        }
    }
}

/// Output locations. The first entry of each list is the startup default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directories frames may be written to
    pub output: Vec<PathBuf>,
    /// Archive destinations
    #[serde(default)]
    pub archive: Vec<String>,
}

/// Commands run at the start and end of a batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Run before the first frame
    #[serde(default)]
    pub begin: HookSet,
    /// Run after the last frame
    #[serde(default)]
    pub end: HookSet,
}

/// One command per image type. Zero and dark frames never run hooks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookSet {
    /// Hook for flat fields
    #[serde(default)]
    pub flat: Option<String>,
    /// Hook for comparison arcs
    #[serde(default)]
    pub comp: Option<String>,
    /// Hook for science frames
    #[serde(default)]
    pub object: Option<String>,
}

impl HookSet {
    /// Command configured for `image_type`, if any.
    pub fn for_image_type(&self, image_type: ImageType) -> Option<&str> {
        match image_type {
            ImageType::Flat => self.flat.as_deref(),
            ImageType::Comp => self.comp.as_deref(),
            ImageType::Object => self.object.as_deref(),
            ImageType::Zero | ImageType::Dark => None,
        }
    }
}

/// Sensor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcdConfig {
    /// Requested temperature in degrees Celsius
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Expected readout duration in seconds
    #[serde(default = "default_readout_time")]
    pub readout_time: u32,
    /// First column, 1-based
    #[serde(default = "default_one")]
    pub x1: u32,
    /// Last column, inclusive
    #[serde(default = "default_size")]
    pub x2: u32,
    /// Horizontal binning
    #[serde(default = "default_one")]
    pub xb: u32,
    /// First row, 1-based
    #[serde(default = "default_one")]
    pub y1: u32,
    /// Last row, inclusive
    #[serde(default = "default_size")]
    pub y2: u32,
    /// Vertical binning
    #[serde(default = "default_one")]
    pub yb: u32,
    /// Bits per sensor word
    #[serde(default = "default_bits_per_pixel")]
    pub bits_per_pixel: u32,
}

impl Default for CcdConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            readout_time: default_readout_time(),
            x1: 1,
            x2: default_size(),
            xb: 1,
            y1: 1,
            y2: default_size(),
            yb: 1,
            bits_per_pixel: default_bits_per_pixel(),
        }
    }
}

impl CcdConfig {
    /// Region of interest the driver starts with.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            x1: self.x1,
            x2: self.x2,
            xb: self.xb,
            y1: self.y1,
            y2: self.y2,
            yb: self.yb,
            bits_per_pixel: self.bits_per_pixel,
        }
    }
}

// Default value functions
fn default_allowed_ips() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_driver() -> String {
    "dummy".to_string()
}

fn default_temperature() -> f64 {
    -110.0
}

fn default_readout_time() -> u32 {
    5
}

fn default_one() -> u32 {
    1
}

fn default_size() -> u32 {
    2048
}

fn default_bits_per_pixel() -> u32 {
    16
}

impl ExposedConfig {
    /// Load configuration from the default path with environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("EXPOSED_").split("__"));
        Self::extract(figment)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::from(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: ExposedConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.exposed.instrument_prefix;
        if prefix.len() != 1 || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::ValidationError(format!(
                "instrument_prefix must be a single letter, got '{prefix}'"
            )));
        }

        if self.exposed.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "listen address '{}' is not a socket address",
                self.exposed.listen
            )));
        }

        if self.paths.output.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one output path is required".to_string(),
            ));
        }

        let ccd = &self.ccd;
        if ccd.x1 == 0 || ccd.x1 > ccd.x2 || ccd.y1 == 0 || ccd.y1 > ccd.y2 {
            return Err(ConfigError::ValidationError(format!(
                "invalid region x1={} x2={} y1={} y2={}",
                ccd.x1, ccd.x2, ccd.y1, ccd.y2
            )));
        }
        if ccd.xb == 0 || ccd.yb == 0 {
            return Err(ConfigError::ValidationError(
                "binning must be at least 1".to_string(),
            ));
        }
        if ccd.bits_per_pixel != 16 {
            return Err(ConfigError::ValidationError(format!(
                "bits_per_pixel {} is not supported",
                ccd.bits_per_pixel
            )));
        }

        if let Some(key) = self.header.keys().find(|k| HeaderKey::from_name(k).is_none()) {
            return Err(ConfigError::ValidationError(format!(
                "header default '{key}' is not a known keyword"
            )));
        }

        Ok(())
    }

    /// First configured output directory.
    pub fn default_output_path(&self) -> PathBuf {
        self.paths.output.first().cloned().unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    /// First configured archive location, empty if none.
    pub fn default_archive_path(&self) -> String {
        self.paths.archive.first().cloned().unwrap_or_default()
    }

    /// First character of the configured prefix.
    pub fn instrument_prefix(&self) -> char {
        self.exposed.instrument_prefix.chars().next().unwrap_or('x')
    }
}
