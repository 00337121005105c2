//! Image persistence.
//!
//! [`save_image`] turns a read-out frame into files: the raw sidecar from the
//! driver first, then the FITS image with every non-empty header entry, a
//! `DATE` card and a checksum. The sidecar is removed only once the image has
//! been written, so a failed write always leaves the sensor words on disk.

use std::path::Path;

use tracing::{info, warn};

use crate::driver::CcdDriver;
use crate::error::{FitsError, PersistError};
use crate::fits::{FitsImage, FitsValue};
use crate::header::{HeaderTable, HeaderValueType};
use crate::hooks;
use crate::naming::FrameNames;
use crate::state::SharedState;

/// Write the frame held by the driver. Returns the size of the image file.
pub async fn save_image(
    shared: &SharedState,
    driver: &dyn CcdDriver,
    frame: &FrameNames,
    archive_script: Option<&str>,
) -> Result<u64, PersistError> {
    let (header, geometry, archive) = shared.with(|s| {
        (
            s.header.clone(),
            s.descriptor.geometry,
            s.descriptor.archive,
        )
    });

    info!("BEGIN header");
    for (key, _) in header.non_empty() {
        info!("    {}", header.render(key));
    }
    info!("END header");

    match driver.save_raw_image(&frame.raw).await {
        Ok(()) => shared.info(&format!("save raw image {} success", frame.raw.display())),
        Err(e) => shared.warn(&format!("Warning: save_raw_image(): {e}")),
    }

    let mut image = FitsImage::create(&frame.fits, geometry.width(), geometry.height())?;
    write_header(&mut image, &header)?;
    image.write_date();
    driver.save_fits_file(&mut image).await?;
    image.write_checksum();

    let written = tokio::task::spawn_blocking(move || image.close())
        .await
        .map_err(|e| PersistError::Io(std::io::Error::other(e)))??;
    shared.info(&format!("save fits file {} success", frame.fits.display()));

    remove_sidecar(shared, &frame.raw).await;

    if archive {
        match archive_script {
            Some(script) => {
                shared.info(&format!("execute archive script {script} {}", frame.fits.display()));
                hooks::run_archive(script, &frame.fits).await;
            }
            None => warn!("archiving enabled but no archive script configured"),
        }
    }

    Ok(written)
}

/// Write every non-empty entry with its declared type.
///
/// Numeric values that do not parse are skipped with a warning rather than
/// failing the frame.
pub fn write_header(image: &mut FitsImage, header: &HeaderTable) -> Result<(), FitsError> {
    for (key, entry) in header.non_empty() {
        let value = entry.value.trim();
        let typed = match key.value_type() {
            HeaderValueType::Str => Some(FitsValue::Str(&entry.value)),
            HeaderValueType::Int => parse_int(value).map(FitsValue::Int),
            HeaderValueType::Float | HeaderValueType::Double => {
                value.parse::<f64>().ok().map(FitsValue::Real)
            }
        };

        match typed {
            Some(v) => image.write_key(key.name(), v, &entry.comment)?,
            None => warn!(key = %key, value = %entry.value, "header value does not match its type, skipped"),
        }
    }
    Ok(())
}

fn parse_int(value: &str) -> Option<i64> {
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|f| f as i64))
}

async fn remove_sidecar(shared: &SharedState, raw: &Path) {
    match tokio::fs::remove_file(raw).await {
        Ok(()) => shared.info(&format!("remove raw image {}", raw.display())),
        Err(e) => shared.warn(&format!("Warning: remove raw image {} failed: {e}", raw.display())),
    }
}
