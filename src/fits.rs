//! Native FITS primary-HDU writer.
//!
//! Writes a single 2-D image HDU with 16-bit unsigned pixels stored using the
//! usual `BITPIX = 16`, `BZERO = 32768` convention. The header is a sequence of
//! 80-column cards; header and data are each padded to 2880-byte records.
//!
//! The image is assembled in memory and written on [`FitsImage::close`]. When
//! [`FitsImage::write_checksum`] has been called, `DATASUM` and `CHECKSUM` cards
//! are added and filled in at close time, following the ones' complement
//! checksum convention.
//!
//! ```rust,ignore
//! let mut image = FitsImage::create(&path, 2048, 2048)?;
//! image.write_key("OBJECT", FitsValue::Str("Vega"), "Title of observation")?;
//! image.write_date();
//! image.write_pixels(&pixels)?;
//! image.write_checksum();
//! image.close()?;
//! ```

use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use chrono::Utc;

use crate::error::FitsError;

/// Size of a FITS logical record.
pub const BLOCK_LEN: usize = 2880;
/// Width of one header card.
pub const CARD_LEN: usize = 80;

const CHECKSUM_PLACEHOLDER: &str = "0000000000000000";

/// A typed header value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitsValue<'a> {
    /// Quoted string, at most 68 characters.
    Str(&'a str),
    /// Integer.
    Int(i64),
    /// Real number.
    Real(f64),
    /// `T` or `F`.
    Logical(bool),
}

/// An image HDU under construction.
#[derive(Debug)]
pub struct FitsImage {
    path: PathBuf,
    width: usize,
    height: usize,
    cards: Vec<String>,
    data: Option<BytesMut>,
    checksum: bool,
}

impl FitsImage {
    /// Start a new unsigned 16-bit image. Fails if `path` already exists.
    pub fn create(path: impl AsRef<Path>, width: usize, height: usize) -> Result<Self, FitsError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(FitsError::Exists(path));
        }

        let cards = vec![
            card("SIMPLE", FitsValue::Logical(true), "file does conform to FITS standard"),
            card("BITPIX", FitsValue::Int(16), "number of bits per data pixel"),
            card("NAXIS", FitsValue::Int(2), "number of data axes"),
            card("NAXIS1", FitsValue::Int(width as i64), "length of data axis 1"),
            card("NAXIS2", FitsValue::Int(height as i64), "length of data axis 2"),
            card("EXTEND", FitsValue::Logical(true), "FITS dataset may contain extensions"),
            card("BZERO", FitsValue::Int(32768), "offset data range to that of unsigned short"),
            card("BSCALE", FitsValue::Int(1), "REAL=TAPE*BSCALE+BZERO"),
        ];

        Ok(Self {
            path,
            width,
            height,
            cards,
            data: None,
            checksum: false,
        })
    }

    /// Target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Append a keyword card.
    pub fn write_key(&mut self, key: &str, value: FitsValue<'_>, comment: &str) -> Result<(), FitsError> {
        if !is_valid_keyword(key) {
            return Err(FitsError::InvalidKeyword(key.to_string()));
        }
        self.cards.push(card(key, value, comment));
        Ok(())
    }

    /// Append the `DATE` card with the current UTC time.
    pub fn write_date(&mut self) {
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        self.cards.push(card(
            "DATE",
            FitsValue::Str(&now),
            "file creation date (YYYY-MM-DDThh:mm:ss UT)",
        ));
    }

    /// Store the pixel array, row-major, `width * height` values.
    pub fn write_pixels(&mut self, pixels: &[u16]) -> Result<(), FitsError> {
        let expected = self.width * self.height;
        if pixels.len() != expected {
            return Err(FitsError::PixelCount {
                expected,
                actual: pixels.len(),
            });
        }

        let mut data = BytesMut::with_capacity(padded_len(expected * 2));
        for &pixel in pixels {
            // Stored value is pixel - BZERO as a signed big-endian word.
            data.put_u16(pixel ^ 0x8000);
        }
        data.resize(padded_len(expected * 2), 0);
        self.data = Some(data);
        Ok(())
    }

    /// Request `DATASUM` / `CHECKSUM` cards.
    pub fn write_checksum(&mut self) {
        self.checksum = true;
    }

    /// Write the file. Returns the number of bytes written.
    pub fn close(self) -> Result<u64, FitsError> {
        let data = self.data.ok_or(FitsError::MissingData)?;

        let mut cards = self.cards;
        let mut checksum_index = None;
        if self.checksum {
            let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
            let datasum = checksum_add(0, &data).to_string();
            cards.push(card(
                "DATASUM",
                FitsValue::Str(&datasum),
                &format!("data unit checksum updated {stamp}"),
            ));
            checksum_index = Some(cards.len());
            cards.push(card(
                "CHECKSUM",
                FitsValue::Str(CHECKSUM_PLACEHOLDER),
                &format!("HDU checksum updated {stamp}"),
            ));
        }

        let mut header = render_header(&cards);
        if let Some(index) = checksum_index {
            let sum = checksum_add(checksum_add(0, &header), &data);
            let encoded = encode_checksum(!sum);
            // Value starts right after `CHECKSUM= '`.
            let offset = index * CARD_LEN + 11;
            header[offset..offset + 16].copy_from_slice(encoded.as_bytes());
        }

        let mut out = Vec::with_capacity(header.len() + data.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&data);
        std::fs::write(&self.path, &out)?;
        Ok(out.len() as u64)
    }
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_LEN) * BLOCK_LEN
}

fn render_header(cards: &[String]) -> Vec<u8> {
    let mut header = String::with_capacity(padded_len((cards.len() + 1) * CARD_LEN));
    for c in cards {
        header.push_str(c);
    }
    header.push_str(&format!("{:<80}", "END"));
    let padded = padded_len(header.len());
    while header.len() < padded {
        header.push(' ');
    }
    header.into_bytes()
}

fn is_valid_keyword(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 8
        && key
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

/// Format one 80-column card.
pub fn card(key: &str, value: FitsValue<'_>, comment: &str) -> String {
    let value = match value {
        FitsValue::Str(s) => {
            let escaped: String = s
                .chars()
                .filter(|c| c.is_ascii() && !c.is_ascii_control())
                .collect::<String>()
                .replace('\'', "''");
            let escaped: String = escaped.chars().take(68).collect();
            format!("'{escaped:<8}'")
        }
        FitsValue::Int(i) => format!("{i:>20}"),
        FitsValue::Real(r) => format!("{:>20}", format_real(r)),
        FitsValue::Logical(b) => format!("{:>20}", if b { "T" } else { "F" }),
    };

    let mut line = format!("{key:<8}= {value}");
    if !comment.is_empty() {
        line.push_str(" / ");
        line.push_str(comment);
    }
    let mut line: String = line
        .chars()
        .filter(|c| c.is_ascii())
        .take(CARD_LEN)
        .collect();
    while line.len() < CARD_LEN {
        line.push(' ');
    }
    line
}

fn format_real(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}").replace('e', "E")
    }
}

/// Ones' complement 32-bit sum of big-endian words, continuing from `sum`.
pub fn checksum_add(sum: u32, bytes: &[u8]) -> u32 {
    let mut hi = u64::from(sum >> 16);
    let mut lo = u64::from(sum & 0xffff);
    for word in bytes.chunks_exact(4) {
        hi += u64::from(u16::from_be_bytes([word[0], word[1]]));
        lo += u64::from(u16::from_be_bytes([word[2], word[3]]));
    }

    let mut hicarry = hi >> 16;
    let mut locarry = lo >> 16;
    while hicarry != 0 || locarry != 0 {
        hi = (hi & 0xffff) + locarry;
        lo = (lo & 0xffff) + hicarry;
        hicarry = hi >> 16;
        locarry = lo >> 16;
    }
    ((hi << 16) | lo) as u32
}

/// ASCII encoding of a 32-bit checksum (16 characters).
pub fn encode_checksum(value: u32) -> String {
    const EXCLUDE: [u8; 13] = [
        0x3a, 0x3b, 0x3c, 0x3d, 0x3e, 0x3f, 0x40, 0x5b, 0x5c, 0x5d, 0x5e, 0x5f, 0x60,
    ];
    const OFFSET: u8 = 0x30;

    let mut asc = [0u8; 16];
    for i in 0..4 {
        let byte = ((value >> (24 - 8 * i)) & 0xff) as u8;
        let quotient = byte / 4 + OFFSET;
        let remainder = byte % 4;
        let mut ch = [quotient; 4];
        ch[0] += remainder;

        loop {
            let mut adjusted = false;
            for j in (0..4).step_by(2) {
                if EXCLUDE.contains(&ch[j]) || EXCLUDE.contains(&ch[j + 1]) {
                    ch[j] += 1;
                    ch[j + 1] -= 1;
                    adjusted = true;
                }
            }
            if !adjusted {
                break;
            }
        }

        for (j, c) in ch.iter().enumerate() {
            asc[4 * j + i] = *c;
        }
    }

    // Rotate one place right to match the card alignment.
    (0..16).map(|i| asc[(i + 15) % 16] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_card_layout() {
        let c = card("NAXIS1", FitsValue::Int(2048), "length of data axis 1");
        assert_eq!(c.len(), CARD_LEN);
        assert!(c.starts_with("NAXIS1  =                 2048 / length of data axis 1"));

        let c = card("OBJECT", FitsValue::Str("Vega"), "");
        assert_eq!(c.trim_end(), "OBJECT  = 'Vega    '");

        let c = card("OBSERVER", FitsValue::Str("O'Hara"), "Observers");
        assert!(c.starts_with("OBSERVER= 'O''Hara ' / Observers"));

        let c = card("EPOCH", FitsValue::Real(2000.0), "");
        assert_eq!(c.trim_end(), "EPOCH   =               2000.0");
    }

    #[test]
    fn test_invalid_keyword_rejected() {
        let dir = tempdir().unwrap();
        let mut image = FitsImage::create(dir.path().join("a.fit"), 2, 2).unwrap();
        assert!(image.write_key("lower", FitsValue::Int(1), "").is_err());
        assert!(image.write_key("TOOLONGKEY", FitsValue::Int(1), "").is_err());
        assert!(image.write_key("DATE-OBS", FitsValue::Str("2024-01-01"), "").is_ok());
    }

    #[test]
    fn test_pixel_count_checked() {
        let dir = tempdir().unwrap();
        let mut image = FitsImage::create(dir.path().join("a.fit"), 4, 4).unwrap();
        let err = image.write_pixels(&[0u16; 3]).unwrap_err();
        assert!(matches!(err, FitsError::PixelCount { expected: 16, actual: 3 }));
    }

    #[test]
    fn test_close_without_pixels_fails() {
        let dir = tempdir().unwrap();
        let image = FitsImage::create(dir.path().join("a.fit"), 4, 4).unwrap();
        assert!(matches!(image.close(), Err(FitsError::MissingData)));
    }

    #[test]
    fn test_existing_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.fit");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(FitsImage::create(&path, 1, 1), Err(FitsError::Exists(_))));
    }

    #[test]
    fn test_written_file_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.fit");
        let mut image = FitsImage::create(&path, 3, 2).unwrap();
        image.write_key("OBJECT", FitsValue::Str("Vega"), "Title of observation").unwrap();
        image.write_date();
        image.write_pixels(&[0, 1, 32768, 65535, 100, 200]).unwrap();
        let written = image.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, written);
        assert_eq!(bytes.len(), 2 * BLOCK_LEN);

        let header = std::str::from_utf8(&bytes[..BLOCK_LEN]).unwrap();
        assert!(header.starts_with("SIMPLE  =                    T"));
        assert!(header.contains("BZERO   =                32768"));
        assert!(header.contains("BSCALE  =                    1 / REAL=TAPE*BSCALE+BZERO"));
        assert!(header.contains("OBJECT  = 'Vega    ' / Title of observation"));
        assert!(header.contains("DATE    = '"));
        assert!(header.contains(&format!("{:<80}", "END")));

        // First pixel 0 is stored as -32768, 32768 as 0.
        let data = &bytes[BLOCK_LEN..];
        assert_eq!(&data[0..2], &[0x80, 0x00]);
        assert_eq!(&data[4..6], &[0x00, 0x00]);
        assert_eq!(&data[6..8], &[0x7f, 0xff]);
    }

    #[test]
    fn test_checksum_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sum.fit");
        let mut image = FitsImage::create(&path, 16, 16).unwrap();
        image.write_key("OBJECT", FitsValue::Str("HD 12345"), "").unwrap();
        let pixels: Vec<u16> = (0..256u16).map(|i| i.wrapping_mul(257)).collect();
        image.write_pixels(&pixels).unwrap();
        image.write_checksum();
        image.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = std::str::from_utf8(&bytes[..BLOCK_LEN]).unwrap();
        assert!(header.contains("DATASUM = '"));
        assert!(header.contains("CHECKSUM= '"));
        assert!(!header.contains(CHECKSUM_PLACEHOLDER));

        // A correct CHECKSUM makes the whole HDU sum to negative zero.
        assert_eq!(checksum_add(0, &bytes), u32::MAX);
    }

    #[test]
    fn test_encode_checksum_alphabet() {
        let encoded = encode_checksum(0x1234_abcd);
        assert_eq!(encoded.len(), 16);
        assert!(encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase() || b.is_ascii_lowercase()));
    }
}
