//! Frame file naming.
//!
//! Frames are named `<prefix><NNNN>.fit` where the prefix is the instrument
//! letter followed by the observing night's date. The date comes from local
//! time shifted back by 12 hours, so a whole night (evening to morning) shares
//! one prefix. Each frame also gets a `.raw` sidecar with the same stem.

use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};

/// Highest sequence number tried for one prefix.
pub const MAX_FRAME_NUMBER: u32 = 999;

/// Paths allocated for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameNames {
    /// Sequence number, 1 to 999.
    pub number: u32,
    /// Raw sidecar path.
    pub raw: PathBuf,
    /// FITS image path.
    pub fits: PathBuf,
}

impl FrameNames {
    /// Basename of the image file, used for the FILENAME header key.
    pub fn fits_basename(&self) -> String {
        self.fits
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// `iYYYYMMDD` for the night containing `local_now`.
pub fn frame_prefix(instrument_prefix: char, local_now: NaiveDateTime) -> String {
    let night = local_now - Duration::hours(12);
    format!("{}{}", instrument_prefix, night.format("%Y%m%d"))
}

/// First sequence number for which neither the sidecar nor the image exists.
pub fn allocate_frame(dir: &Path, prefix: &str) -> Option<FrameNames> {
    (1..=MAX_FRAME_NUMBER).find_map(|number| {
        let stem = format!("{prefix}{number:04}");
        let raw = dir.join(format!("{stem}.raw"));
        let fits = dir.join(format!("{stem}.fit"));
        if raw.exists() || fits.exists() {
            None
        } else {
            Some(FrameNames { number, raw, fits })
        }
    })
}
