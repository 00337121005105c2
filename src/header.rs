//! FITS Header Table
//!
//! The header table is a fixed, ordered set of entries, one per [`HeaderKey`].
//! The schema is closed: keys are an enum, so an entry can never be inserted for
//! a keyword the FITS writer does not know how to type. Lookups by name go
//! through [`HeaderKey::from_name`], which is where unknown keywords are
//! rejected.
//!
//! Each entry carries a textual value and comment. The value type is a property
//! of the key and is only consulted when the image is written.
//!
//! # Limits
//!
//! Values are truncated to [`VALUE_MAX`] characters and comments to
//! [`COMMENT_MAX`], which keeps every rendered card inside 80 columns.

use std::fmt;

/// Maximum length of a header value.
pub const VALUE_MAX: usize = 68;
/// Maximum length of a header comment.
pub const COMMENT_MAX: usize = 44;

/// Semantic type used when writing a value to the FITS file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderValueType {
    /// Quoted string.
    Str,
    /// Integer.
    Int,
    /// Single precision real.
    Float,
    /// Double precision real.
    Double,
}

macro_rules! header_schema {
    ($($variant:ident => $name:literal, $ty:ident, $comment:literal;)+) => {
        /// Every keyword the daemon knows, in the order they are written.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum HeaderKey {
            $(
                #[doc = $name]
                $variant,
            )+
        }

        impl HeaderKey {
            /// All keys in schema order.
            pub const ALL: &'static [HeaderKey] = &[$(HeaderKey::$variant),+];

            /// FITS keyword.
            pub fn name(self) -> &'static str {
                match self {
                    $(HeaderKey::$variant => $name,)+
                }
            }

            /// Declared value type.
            pub fn value_type(self) -> HeaderValueType {
                match self {
                    $(HeaderKey::$variant => HeaderValueType::$ty,)+
                }
            }

            /// Comment the entry starts with.
            pub fn default_comment(self) -> &'static str {
                match self {
                    $(HeaderKey::$variant => $comment,)+
                }
            }
        }
    };
}

header_schema! {
    Origin   => "ORIGIN",   Str,   "AsU AV CR Ondrejov";
    Observat => "OBSERVAT", Str,   "Name of observatory (IRAF style)";
    Latitude => "LATITUDE", Float, "Telescope latitude  (degrees), +49:54:38.0";
    Longitud => "LONGITUD", Float, "Telescope longitud  (degrees), +14:47:01.0";
    Height   => "HEIGHT",   Int,   "Height above sea level [m].";
    Telescop => "TELESCOP", Str,   "2m Ondrejov observatory telescope";
    Gain     => "GAIN",     Int,   "Electrons per ADU";
    Readnois => "READNOIS", Int,   "Readout noise in electrons per pix";
    Telsyst  => "TELSYST",  Str,   "Telescope setup - COUDE or CASSegrain";
    Instrume => "INSTRUME", Str,   "Coude echelle spectrograph";
    Camera   => "CAMERA",   Str,   "Camera head name";
    Detector => "DETECTOR", Str,   "Name of the detector";
    Chipid   => "CHIPID",   Str,   "Name of CCD chip";
    Bunit    => "BUNIT",    Str,   "Unit of the array of image data";
    Preflash => "PREFLASH", Int,   "Length of preflash in seconds";
    Ccdxsize => "CCDXSIZE", Int,   "X Size in pixels of digitised frame";
    Ccdysize => "CCDYSIZE", Int,   "Y Size in pixels of digitised frame";
    Ccdxpixe => "CCDXPIXE", Float, "Size in microns of the pixels, in X";
    Ccdypixe => "CCDYPIXE", Float, "Size in microns of the pixels, in Y";
    Dispaxis => "DISPAXIS", Int,   "Dispersion axis along lines";
    Gratname => "GRATNAME", Str,   "Grating name - ID";
    Slittype => "SLITTYPE", Str,   "Type of slit - blade or image slicers";
    Autoguid => "AUTOGUID", Str,   "Status of autoguider system";
    Slitwid  => "SLITWID",  Float, "Slit width in mm";
    Colimat  => "COLIMAT",  Str,   "Collimator mask status";
    TleTrcs  => "TLE-TRCS", Str,   "Correction Set";
    TleTrgv  => "TLE-TRGV", Str,   "Guiding Value";
    TleTrhd  => "TLE-TRHD", Str,   "Hour and Declination Axis";
    TleTrrd  => "TLE-TRRD", Str,   "Right ascension and Declination";
    TleTrus  => "TLE-TRUS", Str,   "User Speed";
    SghMco   => "SGH-MCO",  Str,   "Mirror Coude Oes";
    SghMsc   => "SGH-MSC",  Str,   "Mirror Star Calibration";
    SghCpa   => "SGH-CPA",  Str,   "Correction plate 700";
    SghCpb   => "SGH-CPB",  Str,   "Correction plate 400";
    SghOic   => "SGH-OIC",  Int,   "OES Iodine cell";
    TmDiff   => "TM-DIFF",  Int,   "";
    Object   => "OBJECT",   Str,   "Title of observation";
    Imagetyp => "IMAGETYP", Str,   "Type of observation, eg. FLAT";
    Observer => "OBSERVER", Str,   "Observers";
    Sysver   => "SYSVER",   Str,   "";
    Readspd  => "READSPD",  Str,   "";
    Filename => "FILENAME", Str,   "";
    Camfocus => "CAMFOCUS", Float, "Camera focus position";
    Spectemp => "SPECTEMP", Float, "Temperature in spectrograph room";
    Specfilt => "SPECFILT", Int,   "Spectral filter";
    Slitheig => "SLITHEIG", Float, "Slit hight in mm";
    TmStart  => "TM_START", Int,   "";
    Ut       => "UT",       Str,   "UTC of  start of observation";
    Epoch    => "EPOCH",    Double, "Same as EQUINOX - for back compat";
    Equinox  => "EQUINOX",  Double, "Equinox of RA and DEC";
    DateObs  => "DATE-OBS", Str,   "UTC date start of observation";
    TmEnd    => "TM_END",   Int,   "";
    Exptime  => "EXPTIME",  Int,   "Length of observation excluding pauses";
    Darktime => "DARKTIME", Int,   "Length of observation including pauses";
    Ccdtemp  => "CCDTEMP",  Int,   "Detector temperature";
    Expval   => "EXPVAL",   Float, "Exposure value in photon counts [Mcounts]";
    Biassec  => "BIASSEC",  Str,   "Overscan portion of frame";
    Trimsec  => "TRIMSEC",  Str,   "Region to be extracted";
    Gratang  => "GRATANG",  Float, "";
    Gratpos  => "GRATPOS",  Int,   "Grating angle in increments";
    Dichmir  => "DICHMIR",  Int,   "Dichroic mirror number";
    Flattype => "FLATTYPE", Str,   "Flat type (Projector/Dome)";
    Complamp => "COMPLAMP", Str,   "Comparison arc setup";
    Ra       => "RA",       Str,   "";
    Dec      => "DEC",      Str,   "";
    St       => "ST",       Str,   "Local sidereal time at start of observation";
    Telfocus => "TELFOCUS", Float, "Telescope focus (milimeters)";
    Domeaz   => "DOMEAZ",   Float, "Mean dome azimuth during observation";
    Airpress => "AIRPRESS", Float, "Atmospheric preasure in (hPa)";
    Airhumex => "AIRHUMEX", Float, "Air humidity outside the dome";
    Outtemp  => "OUTTEMP",  Float, "Temperature outside of the dome";
    Dometemp => "DOMETEMP", Float, "Temperature inside the dome";
    Amplm    => "AMPLM",    Str,   "Amplifier A,B or AB";
    Ccdsum   => "CCDSUM",   Str,   "CCD binning in both axes";
    Ccdximsi => "CCDXIMSI", Int,   "X Size of useful imaging area";
    Ccdximst => "CCDXIMST", Int,   "X Start pixel of useful imaging area";
    Ccdyimsi => "CCDYIMSI", Int,   "Y Size of useful imaging area";
    Ccdyimst => "CCDYIMST", Int,   "Y Start pixel of useful imaging area";
    Datamax  => "DATAMAX",  Int,   "DATA MAX";
    Datamin  => "DATAMIN",  Int,   "DATA MIN";
    Gainm    => "GAINM",    Str,   "Gain mode";
    Mpp      => "MPP",      Str,   "Multiphase pinned mode (T/F)";
}

impl HeaderKey {
    /// Look a keyword up by its exact FITS name.
    pub fn from_name(name: &str) -> Option<HeaderKey> {
        HeaderKey::ALL.iter().copied().find(|key| key.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value and comment of one header entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderEntry {
    /// Value text, empty when unset.
    pub value: String,
    /// Comment text.
    pub comment: String,
}

/// The header table: one entry per [`HeaderKey`], in schema order.
#[derive(Debug, Clone)]
pub struct HeaderTable {
    entries: Vec<HeaderEntry>,
}

impl HeaderTable {
    /// Table with empty values and the schema's default comments.
    pub fn new() -> Self {
        let entries = HeaderKey::ALL
            .iter()
            .map(|key| HeaderEntry {
                value: String::new(),
                comment: key.default_comment().to_string(),
            })
            .collect();
        Self { entries }
    }

    /// Entry for `key`.
    pub fn get(&self, key: HeaderKey) -> &HeaderEntry {
        &self.entries[key.index()]
    }

    /// Value text for `key`.
    pub fn value(&self, key: HeaderKey) -> &str {
        &self.get(key).value
    }

    /// Replace the value and, when `comment` is non-empty, the comment.
    pub fn set(&mut self, key: HeaderKey, value: &str, comment: &str) {
        let entry = &mut self.entries[key.index()];
        entry.value = truncate(value, VALUE_MAX);
        if !comment.is_empty() {
            entry.comment = truncate(comment, COMMENT_MAX);
        }
    }

    /// Replace the value, keeping the comment.
    pub fn set_value(&mut self, key: HeaderKey, value: impl AsRef<str>) {
        self.entries[key.index()].value = truncate(value.as_ref(), VALUE_MAX);
    }

    /// Replace the comment unconditionally.
    pub fn set_comment(&mut self, key: HeaderKey, comment: impl AsRef<str>) {
        self.entries[key.index()].comment = truncate(comment.as_ref(), COMMENT_MAX);
    }

    /// `KEY = value / comment`
    pub fn render(&self, key: HeaderKey) -> String {
        let entry = self.get(key);
        format!("{} = {} / {}", key.name(), entry.value, entry.comment)
    }

    /// Every entry rendered on its own line, then the success marker.
    pub fn render_all(&self) -> String {
        let mut out = String::new();
        for key in HeaderKey::ALL {
            out.push_str(&self.render(*key));
            out.push('\n');
        }
        out.push_str("+OK");
        out
    }

    /// Every entry in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (HeaderKey, &HeaderEntry)> {
        HeaderKey::ALL.iter().copied().zip(self.entries.iter())
    }

    /// Entries that carry a value; only these are persisted.
    pub fn non_empty(&self) -> impl Iterator<Item = (HeaderKey, &HeaderEntry)> {
        self.iter().filter(|(_, entry)| !entry.value.is_empty())
    }
}

impl Default for HeaderTable {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
