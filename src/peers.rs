//! Telescope and spectrograph peer services.
//!
//! The exposure daemon reads pointing, weather and mechanical state from two
//! other daemons at the start of every frame and writes it into the header. The
//! spectrograph service also hosts the exposure meter, an auxiliary photon
//! counter that can end an exposure early once a target count is reached.
//!
//! Both services are reached through traits so the transport stays outside
//! this crate. [`Offline`] implements both for installations without peers;
//! every query fails and the affected header entries keep their defaults.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{info, warn};

use crate::config::Instrument;
use crate::error::PeerError;
use crate::header::{HeaderKey, HeaderTable};

// =============================================================================
// Service interfaces
// =============================================================================

/// Telescope state as reported by the telescope daemon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelescopeInfo {
    /// Focus position
    pub fopo: f32,
    /// Outside air humidity
    pub airhumex: String,
    /// Atmospheric pressure
    pub airpress: String,
    /// Outside temperature
    pub outtemp: String,
    /// Temperature inside the dome
    pub dometemp: String,
    /// Dome azimuth
    pub domeaz: String,
    /// Right ascension, `HH:MM:SS`
    pub ra: String,
    /// Declination, `DD:MM:SS`
    pub dec: String,
    /// Sidereal time
    pub st: String,
    /// Correction set
    pub trcs: String,
    /// Guiding value
    pub trgv: String,
    /// Hour and declination axis
    pub trhd: String,
    /// Right ascension and declination axis
    pub trrd: String,
    /// User speed
    pub trus: String,
    /// Telescope clock, `YYYY-MM-DD HH:MM:SS` UTC
    pub ut: String,
}

/// Raw spectrograph readings. Mechanism positions are small integer codes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpectrographInfo {
    /// Dichroic mirror position
    pub dichroic_mirror: i32,
    /// Spectral filter position
    pub spectral_filter: i32,
    /// 700/400 collimator position
    pub collimator: i32,
    /// OES collimator position
    pub oes_collimator: i32,
    /// Star or calibration light feed
    pub star_calib: i32,
    /// Coudé or OES light path
    pub coude_oes: i32,
    /// Grating angle code
    pub grating_position: i32,
    /// 400 mm camera focus
    pub focus_1400: i32,
    /// 700 mm camera focus
    pub focus_700: i32,
    /// OES camera focus
    pub focus_oes: i32,
    /// Coudé room temperature
    pub coude_temp: i32,
    /// OES room temperature
    pub oes_temp: i32,
    /// Iodine cell position
    pub oes_iodine_cell: i32,
    /// 700 mm correction plate position
    pub correction_plate_700: i32,
    /// 400 mm correction plate position
    pub correction_plate_400: i32,
}

/// Telescope daemon connection.
#[async_trait]
pub trait TelescopeClient: Send + Sync {
    /// Current pointing and weather readings.
    async fn telescope_info(&self) -> Result<TelescopeInfo, PeerError>;
}

/// Spectrograph daemon connection, also carrying the exposure meter.
#[async_trait]
pub trait SpectrographClient: Send + Sync {
    /// Current mechanism positions and temperatures.
    async fn spectrograph_info(&self) -> Result<SpectrographInfo, PeerError>;

    /// Send a raw command, returning the answer text.
    async fn execute(&self, command: &str) -> Result<String, PeerError>;
}

/// Stand-in for peers that are not deployed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

#[async_trait]
impl TelescopeClient for Offline {
    async fn telescope_info(&self) -> Result<TelescopeInfo, PeerError> {
        Err(PeerError::Unavailable("telescope"))
    }
}

#[async_trait]
impl SpectrographClient for Offline {
    async fn spectrograph_info(&self) -> Result<SpectrographInfo, PeerError> {
        Err(PeerError::Unavailable("spectrograph"))
    }

    async fn execute(&self, _command: &str) -> Result<String, PeerError> {
        Err(PeerError::Unavailable("spectrograph"))
    }
}

/// Both peer handles.
#[derive(Clone)]
pub struct Peers {
    /// Telescope daemon
    pub telescope: Arc<dyn TelescopeClient>,
    /// Spectrograph daemon and exposure meter
    pub spectrograph: Arc<dyn SpectrographClient>,
}

impl Peers {
    /// Both peers unreachable. Header fields keep their defaults.
    pub fn offline() -> Self {
        Self {
            telescope: Arc::new(Offline),
            spectrograph: Arc::new(Offline),
        }
    }
}

// =============================================================================
// Header mapping
// =============================================================================

/// Write the telescope snapshot into the header.
pub fn apply_telescope(header: &mut HeaderTable, info: &TelescopeInfo, now: DateTime<Utc>) {
    header.set_value(HeaderKey::TleTrcs, &info.trcs);
    header.set_value(HeaderKey::TleTrgv, &info.trgv);
    header.set_value(HeaderKey::TleTrhd, &info.trhd);
    header.set_value(HeaderKey::TleTrrd, &info.trrd);
    header.set_value(HeaderKey::TleTrus, &info.trus);
    header.set_value(HeaderKey::Airhumex, &info.airhumex);
    header.set_value(HeaderKey::Airpress, &info.airpress);
    header.set_value(HeaderKey::Domeaz, &info.domeaz);
    header.set_value(HeaderKey::Dometemp, &info.dometemp);
    header.set_value(HeaderKey::Outtemp, &info.outtemp);
    header.set_value(HeaderKey::Telfocus, format!("{:.2}", info.fopo));

    header.set_value(HeaderKey::Dec, &info.dec);
    header.set_comment(HeaderKey::Dec, dms_to_decimal(&info.dec).unwrap_or_default());
    header.set_value(HeaderKey::Ra, &info.ra);
    header.set_comment(HeaderKey::Ra, dms_to_decimal(&info.ra).unwrap_or_default());
    header.set_value(HeaderKey::St, &info.st);

    let local = now.timestamp();
    let telescope = NaiveDateTime::parse_from_str(&info.ut, "%Y-%m-%d %H:%M:%S")
        .map(|t| t.and_utc().timestamp())
        .unwrap_or(0);
    header.set_value(HeaderKey::TmDiff, (telescope - local).to_string());
    header.set_comment(HeaderKey::TmDiff, format!("T{telescope} - P{local}"));
}

/// Write the spectrograph snapshot into the header.
pub fn apply_spectrograph(header: &mut HeaderTable, info: &SpectrographInfo, instrument: Instrument) {
    if instrument == Instrument::Oes {
        header.set_value(HeaderKey::SghOic, info.oes_iodine_cell.to_string());
    } else {
        header.set_value(HeaderKey::SghCpa, plate_name(info.correction_plate_700));
        header.set_value(HeaderKey::SghCpb, plate_name(info.correction_plate_400));
        header.set_value(
            HeaderKey::Gratang,
            format!("{:4.2}", grating_angle(info.grating_position)),
        );
        header.set_comment(HeaderKey::Gratang, grating_angle_dm(info.grating_position));
        header.set_value(HeaderKey::Gratpos, info.grating_position.to_string());
        header.set_value(HeaderKey::Specfilt, info.spectral_filter.to_string());
        header.set_value(HeaderKey::Dichmir, info.dichroic_mirror.to_string());
    }

    let collimator = match instrument {
        Instrument::Oes => info.oes_collimator,
        _ => info.collimator,
    };
    header.set_value(HeaderKey::Colimat, collimator_name(collimator));
    header.set_value(
        HeaderKey::SghMco,
        match info.coude_oes {
            1 => "coude",
            2 => "oes",
            _ => "unknown",
        },
    );
    header.set_value(
        HeaderKey::SghMsc,
        match info.star_calib {
            1 => "star",
            2 => "calibration",
            _ => "unknown",
        },
    );

    let (spectemp, camfocus) = match instrument {
        Instrument::Ccd700 => (info.coude_temp, info.focus_700),
        Instrument::Ccd400 => (info.coude_temp, info.focus_1400),
        Instrument::Oes => (info.oes_temp, info.focus_oes),
    };
    header.set_value(HeaderKey::Spectemp, format!("{:.1}", raw_to_celsius(spectemp)));
    header.set_comment(HeaderKey::Spectemp, spectemp.to_string());
    header.set_value(HeaderKey::Camfocus, camfocus.to_string());
}

fn collimator_name(code: i32) -> &'static str {
    match code {
        1 => "open",
        2 => "close",
        3 => "left",
        4 => "right",
        _ => "unknown",
    }
}

fn plate_name(code: i32) -> &'static str {
    match code {
        1 => "in",
        2 => "out",
        _ => "unknown",
    }
}

/// Grating angle in degrees for a position in motor increments.
pub fn grating_angle(position: i32) -> f64 {
    -0.00487106 * f64::from(position) + 61.7024
}

/// Grating angle as `deg:min`.
pub fn grating_angle_dm(position: i32) -> String {
    let angle = grating_angle(position);
    let mut degree = angle.floor();
    let mut minute = ((angle - degree) * 60.0).round();
    if minute >= 60.0 {
        degree += 1.0;
        minute = 0.0;
    }
    format!("{degree:.0}:{minute:.0}")
}

/// Spectrograph room sensor reading to degrees Celsius.
pub fn raw_to_celsius(raw: i32) -> f32 {
    raw as f32 / (27648.0 / 80.0) - 30.0
}

/// `[-]dd:mm:ss[.s]` to decimal degrees (or hours) with six decimals.
pub fn dms_to_decimal(dms: &str) -> Option<String> {
    let dms = dms.trim();
    let negative = dms.starts_with('-');
    let mut parts = dms.trim_start_matches(['-', '+']).split(':');
    let degree: f64 = parts.next()?.trim().parse().ok()?;
    let minute: f64 = parts.next()?.trim().parse().ok()?;
    let second: f64 = parts.next()?.trim().parse().ok()?;
    let value = degree + minute / 60.0 + second / 3600.0;
    Some(format!("{:.6}", if negative { -value } else { value }))
}

// =============================================================================
// Exposure meter
// =============================================================================

/// Photon counter on the spectrograph. Every failure is logged and ignored.
#[derive(Clone)]
pub struct ExposureMeter {
    client: Arc<dyn SpectrographClient>,
    meter_id: u32,
    shutter_id: u32,
}

impl ExposureMeter {
    /// Meter and shutter ids depend on the instrument.
    pub fn new(client: Arc<dyn SpectrographClient>, instrument: Instrument) -> Self {
        let (meter_id, shutter_id) = match instrument {
            Instrument::Ccd700 | Instrument::Ccd400 => (14, 10),
            Instrument::Oes => (24, 23),
        };
        Self {
            client,
            meter_id,
            shutter_id,
        }
    }

    async fn send(&self, command: String) -> Option<String> {
        match self.client.execute(&command).await {
            Ok(answer) => {
                info!(command = %command, answer = %answer, "spectrograph command");
                Some(answer)
            }
            Err(e) => {
                warn!(command = %command, error = %e, "spectrograph command failed");
                None
            }
        }
    }

    /// Reset the counter, open its shutter and start counting.
    pub async fn start(&self) {
        self.send(format!("SSPE {}", self.meter_id)).await;
        self.send(format!("SPCH {} 1", self.shutter_id)).await;
        self.send(format!("SSTE {}", self.meter_id)).await;
    }

    /// Current count of pulses.
    pub async fn counts(&self) -> Option<u64> {
        let answer = self.send(format!("SPCE {}", self.meter_id)).await?;
        answer.trim().parse().ok()
    }

    /// Close the shutter, read the final count and reset. Returns Mcounts.
    pub async fn finish(&self) -> Option<f64> {
        self.send(format!("SPCH {} 2", self.shutter_id)).await;
        let counts = self
            .send(format!("SPCE {}", self.meter_id))
            .await
            .and_then(|answer| answer.trim().parse::<f64>().ok());
        self.send(format!("SSPE {}", self.meter_id)).await;
        counts.map(|c| c / 1_000_000.0)
    }
}
