//! Definition types for rrdb databases.
//!
//! A definition fixes everything about a database file at creation time: the
//! base step, the datasources, and the archives. Nothing in a definition can
//! change after the file exists, because the file layout is derived from it.
//! Definitions are plain serde structs so they can be kept in JSON
//! configuration files.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};

/// Default base step in seconds.
pub const DEFAULT_STEP: u64 = 300;

/// Maximum datasource name length, in UTF-16 code units.
pub const MAX_NAME_LENGTH: usize = 20;

/// Offset applied to "now" when no start time is given.
const DEFAULT_START_OFFSET: u64 = 10;

/// Complete definition of a round-robin database.
///
/// # Example
///
/// ```rust
/// use rrdb::definition::{ArcDef, ConsolFun, DsDef, DsType, RrdDef};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut def = RrdDef::new("/tmp/speed.rrd", 300);
/// def.set_start_time(920_804_400);
/// def.add_datasource(DsDef::new("speed", DsType::Counter, 600, None, None)?);
/// def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 1, 24)?);
/// def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 6, 10)?);
/// def.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RrdDef {
    /// Path of the database file.
    pub path: PathBuf,

    /// Initial last-update time, in seconds since the Unix epoch.
    ///
    /// The first accepted sample must be strictly newer than this.
    pub start_time: u64,

    /// Base step in seconds: the length of one primary data point.
    pub step: u64,

    /// Datasource definitions, in file order.
    pub datasources: Vec<DsDef>,

    /// Archive definitions, in file order.
    pub archives: Vec<ArcDef>,
}

impl RrdDef {
    /// Creates an empty definition starting ten seconds before now.
    pub fn new<P: Into<PathBuf>>(path: P, step: u64) -> Self {
        Self {
            path: path.into(),
            start_time: crate::unix_now().saturating_sub(DEFAULT_START_OFFSET),
            step,
            datasources: Vec::new(),
            archives: Vec::new(),
        }
    }

    /// Sets the initial last-update time.
    pub fn set_start_time(&mut self, start_time: u64) {
        self.start_time = start_time;
    }

    /// Appends a datasource definition.
    pub fn add_datasource(&mut self, ds: DsDef) {
        self.datasources.push(ds);
    }

    /// Appends an archive definition.
    pub fn add_archive(&mut self, arc: ArcDef) {
        self.archives.push(arc);
    }

    /// Validates the whole definition.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the path is empty, the step is zero,
    /// no datasource or archive is defined, a datasource or archive is
    /// individually invalid, or names / (function, steps) pairs repeat.
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(ValidationError::EmptyPath.into());
        }
        if self.step == 0 {
            return Err(ValidationError::ZeroStep.into());
        }
        if self.datasources.is_empty() {
            return Err(ValidationError::NoDatasources.into());
        }
        if self.archives.is_empty() {
            return Err(ValidationError::NoArchives.into());
        }

        for (index, ds) in self.datasources.iter().enumerate() {
            ds.validate()?;
            if self.datasources[..index].iter().any(|other| other.name == ds.name) {
                return Err(ValidationError::DuplicateDatasource {
                    name: ds.name.clone(),
                }
                .into());
            }
        }

        for (index, arc) in self.archives.iter().enumerate() {
            arc.validate()?;
            if self.archives[..index]
                .iter()
                .any(|other| other.consol_fun == arc.consol_fun && other.steps == arc.steps)
            {
                return Err(ValidationError::DuplicateArchive {
                    consol_fun: arc.consol_fun,
                    steps: arc.steps,
                }
                .into());
            }
        }

        Ok(())
    }

    /// Loads a definition from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// [`ValidationError::Json`] if it is not a valid definition document.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let def: Self = serde_json::from_str(&content).map_err(ValidationError::Json)?;
        Ok(def)
    }

    /// Writes this definition to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(ValidationError::Json)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Definition of one datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsDef {
    /// Unique datasource name (at most 20 UTF-16 code units, no whitespace).
    pub name: String,

    /// How raw readings turn into primary data points.
    pub ds_type: DsType,

    /// Maximum gap in seconds between readings before the interval is unknown.
    pub heartbeat: u64,

    /// Lowest accepted rate; anything below becomes unknown.
    pub min: Option<f64>,

    /// Highest accepted rate; anything above becomes unknown.
    pub max: Option<f64>,
}

impl DsDef {
    /// Creates a validated datasource definition.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the name, heartbeat or range is invalid.
    pub fn new<S: Into<String>>(
        name: S,
        ds_type: DsType,
        heartbeat: u64,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Result<Self> {
        let def = Self {
            name: name.into(),
            ds_type,
            heartbeat,
            min,
            max,
        };
        def.validate()?;
        Ok(def)
    }

    /// Validates this datasource definition.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.heartbeat == 0 {
            return Err(ValidationError::ZeroHeartbeat {
                name: self.name.clone(),
            }
            .into());
        }

        if let (Some(min), Some(max)) = (self.min, self.max)
            && min >= max
        {
            return Err(ValidationError::InvalidRange {
                name: self.name.clone(),
                min,
                max,
            }
            .into());
        }

        Ok(())
    }
}

/// Checks a datasource name against the fixed-width string field rules.
fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty".to_string())
    } else if name.encode_utf16().count() > MAX_NAME_LENGTH {
        Some(format!("longer than {MAX_NAME_LENGTH} characters"))
    } else if name.chars().any(char::is_whitespace) {
        Some("contains whitespace".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason,
        }
        .into()),
        None => Ok(()),
    }
}

/// Definition of one archive (consolidation tier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcDef {
    /// How primary data points fold into one archive row.
    pub consol_fun: ConsolFun,

    /// Largest fraction of unknown primary data points a row may contain
    /// and still be known.
    pub xff: f64,

    /// Primary data points per archive row.
    pub steps: u32,

    /// Number of rows retained.
    pub rows: u32,
}

impl ArcDef {
    /// Creates a validated archive definition.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if xff is outside `[0, 1)` or steps/rows is zero.
    pub fn new(consol_fun: ConsolFun, xff: f64, steps: u32, rows: u32) -> Result<Self> {
        let def = Self {
            consol_fun,
            xff,
            steps,
            rows,
        };
        def.validate()?;
        Ok(def)
    }

    /// Validates this archive definition.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.xff) {
            return Err(ValidationError::InvalidXff { xff: self.xff }.into());
        }
        if self.steps == 0 {
            return Err(ValidationError::ZeroArchiveSize {
                consol_fun: self.consol_fun,
                field: "steps",
            }
            .into());
        }
        if self.rows == 0 {
            return Err(ValidationError::ZeroArchiveSize {
                consol_fun: self.consol_fun,
                field: "rows",
            }
            .into());
        }
        Ok(())
    }
}

/// Datasource type: how a raw reading becomes a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsType {
    /// The reading is the value itself (temperature, queue depth).
    Gauge,
    /// A monotonically increasing counter; the rate is its per-second delta.
    Counter,
    /// Like `Counter` but decreases are allowed.
    Derive,
    /// A counter that resets on every read; the rate is reading / elapsed.
    Absolute,
}

impl DsType {
    /// Returns the canonical upper-case name stored in files and dumps.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "GAUGE",
            Self::Counter => "COUNTER",
            Self::Derive => "DERIVE",
            Self::Absolute => "ABSOLUTE",
        }
    }
}

impl fmt::Display for DsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DsType {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "GAUGE" => Ok(Self::Gauge),
            "COUNTER" => Ok(Self::Counter),
            "DERIVE" => Ok(Self::Derive),
            "ABSOLUTE" => Ok(Self::Absolute),
            other => Err(ValidationError::UnknownDsType(other.to_string())),
        }
    }
}

/// Consolidation function: how primary data points fold into an archive row.
///
/// Unknown (NaN) inputs are never folded; they are counted separately by
/// the archive so the xff rule can decide whether the row is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsolFun {
    /// Arithmetic mean of the known values.
    Average,
    /// Smallest known value.
    Min,
    /// Largest known value.
    Max,
    /// Most recent known value.
    Last,
}

impl ConsolFun {
    /// All consolidation functions, in declaration order.
    pub const ALL: [Self; 4] = [Self::Average, Self::Min, Self::Max, Self::Last];

    /// Returns the canonical upper-case name stored in files and dumps.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Last => "LAST",
        }
    }

    /// Folds a known value into a running accumulator.
    ///
    /// A NaN accumulator means "nothing folded yet". `Average` keeps a sum;
    /// the division by the known count happens when the row is flushed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rrdb::definition::ConsolFun;
    ///
    /// let acc = [3.0, 1.0, 2.0]
    ///     .into_iter()
    ///     .fold(f64::NAN, |acc, v| ConsolFun::Min.fold(acc, v));
    /// assert_eq!(acc, 1.0);
    /// ```
    #[inline]
    pub fn fold(self, acc: f64, value: f64) -> f64 {
        if acc.is_nan() {
            return value;
        }
        match self {
            Self::Average => acc + value,
            Self::Min => acc.min(value),
            Self::Max => acc.max(value),
            Self::Last => value,
        }
    }
}

impl fmt::Display for ConsolFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsolFun {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "AVERAGE" => Ok(Self::Average),
            "MIN" => Ok(Self::Min),
            "MAX" => Ok(Self::Max),
            "LAST" => Ok(Self::Last),
            other => Err(ValidationError::UnknownConsolFun(other.to_string())),
        }
    }
}
