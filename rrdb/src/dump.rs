//! XML interchange dump.
//!
//! The dump follows the well-known round-robin dump grammar:
//!
//! ```text
//! rrd
//! ├── version, step, lastupdate
//! ├── ds*      name, type, minimal_heartbeat, min, max, last_ds, value, unknown_sec
//! └── rra*     cf, pdp_per_row, xff
//!     ├── cdp_prep > ds*     value, unknown_datapoints
//!     └── database > row*   v*
//! ```
//!
//! Rows are written oldest first. Unknown values are written as `NaN`.
//! Importing rebuilds the definition from the dump, replays every row into
//! fresh robins and restores the datasource and accumulator state, so the
//! imported database accepts the same next update as the original.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::database::{DbOptions, Rrd, RrdDatabase};
use crate::definition::{ArcDef, ConsolFun, DsDef, DsType, RrdDef};
use crate::error::{FormatError, Result};

/// Dump format version read and written by this crate.
pub const DUMP_VERSION: &str = "0003";

/// Root of a dump document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "rrd")]
pub struct RrdDump {
    /// Format version, always [`DUMP_VERSION`] on export.
    pub version: String,
    /// Base step in seconds.
    pub step: u64,
    /// Last update time.
    pub lastupdate: u64,
    /// Datasources in file order.
    #[serde(rename = "ds", default)]
    pub datasources: Vec<DsDump>,
    /// Archives in file order.
    #[serde(rename = "rra", default)]
    pub archives: Vec<RraDump>,
}

/// One datasource with its accumulation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsDump {
    /// Datasource name.
    pub name: String,
    /// Type name, e.g. `GAUGE`.
    #[serde(rename = "type")]
    pub ds_type: String,
    /// Heartbeat in seconds.
    pub minimal_heartbeat: u64,
    /// Lower bound, NaN when unset.
    pub min: f64,
    /// Upper bound, NaN when unset.
    pub max: f64,
    /// Last raw reading.
    pub last_ds: f64,
    /// Accumulated `rate * seconds` of the current base step.
    pub value: f64,
    /// Unknown seconds in the current base step.
    pub unknown_sec: u64,
}

/// One archive with its accumulators and rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RraDump {
    /// Consolidation function name, e.g. `AVERAGE`.
    pub cf: String,
    /// Base steps per row.
    pub pdp_per_row: u32,
    /// Unknown-fraction tolerance.
    pub xff: f64,
    /// One accumulator per datasource.
    pub cdp_prep: CdpPrep,
    /// Rows, oldest first.
    pub database: RowsDump,
}

/// Accumulators of one archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdpPrep {
    /// One entry per datasource.
    #[serde(rename = "ds", default)]
    pub datasources: Vec<CdpDump>,
}

/// Accumulator of one (archive, datasource) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdpDump {
    /// Folded value of the current row.
    pub value: f64,
    /// Unknown PDPs in the current row.
    pub unknown_datapoints: u32,
}

/// Rows of one archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsDump {
    /// Rows, oldest first.
    #[serde(rename = "row", default)]
    pub rows: Vec<RowDump>,
}

/// One row: one value per datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDump {
    /// Values in datasource order.
    #[serde(rename = "v", default)]
    pub values: Vec<f64>,
}

impl RrdDump {
    pub(crate) fn from_rrd(rrd: &Rrd) -> Self {
        let ds_count = rrd.datasources.len();
        Self {
            version: DUMP_VERSION.to_string(),
            step: rrd.header.step(),
            lastupdate: rrd.header.last_update_time(),
            datasources: rrd
                .datasources
                .iter()
                .map(|ds| DsDump {
                    name: ds.name().to_string(),
                    ds_type: ds.ds_type().to_string(),
                    minimal_heartbeat: ds.heartbeat(),
                    min: ds.min(),
                    max: ds.max(),
                    last_ds: ds.last_value(),
                    value: ds.accum_value(),
                    unknown_sec: ds.nan_seconds(),
                })
                .collect(),
            archives: rrd
                .archives
                .iter()
                .map(|arc| {
                    let columns: Vec<Vec<f64>> =
                        (0..ds_count).map(|ds| arc.robin(ds).values()).collect();
                    RraDump {
                        cf: arc.consol_fun().to_string(),
                        pdp_per_row: arc.steps(),
                        xff: arc.xff(),
                        cdp_prep: CdpPrep {
                            datasources: (0..ds_count)
                                .map(|ds| CdpDump {
                                    value: arc.state(ds).accum_value(),
                                    unknown_datapoints: arc.state(ds).nan_steps(),
                                })
                                .collect(),
                        },
                        database: RowsDump {
                            rows: (0..arc.rows() as usize)
                                .map(|row| RowDump {
                                    values: columns.iter().map(|column| column[row]).collect(),
                                })
                                .collect(),
                        },
                    }
                })
                .collect(),
        }
    }

    /// Rebuilds the definition and state described by this dump.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::DumpVersion`] for a foreign version,
    /// [`FormatError::InconsistentDump`] if row or accumulator widths do not
    /// match the datasource count, or a [`ValidationError`](crate::error::ValidationError)
    /// if the definitions are invalid.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn to_rrd(&self, path: &Path) -> Result<(RrdDef, Rrd)> {
        if self.version != DUMP_VERSION {
            return Err(FormatError::DumpVersion {
                found: self.version.clone(),
                expected: DUMP_VERSION,
            }
            .into());
        }

        let mut def = RrdDef::new(path, self.step);
        def.set_start_time(self.lastupdate);
        for ds in &self.datasources {
            def.add_datasource(DsDef::new(
                ds.name.clone(),
                ds.ds_type.parse::<DsType>()?,
                ds.minimal_heartbeat,
                known(ds.min),
                known(ds.max),
            )?);
        }
        for rra in &self.archives {
            def.add_archive(ArcDef::new(
                rra.cf.parse::<ConsolFun>()?,
                rra.xff,
                rra.pdp_per_row,
                rra.database.rows.len() as u32,
            )?);
        }
        def.validate()?;

        let ds_count = def.datasources.len();
        let mut rrd = Rrd::from_def(&def);
        for (ds, dump) in rrd.datasources.iter_mut().zip(&self.datasources) {
            ds.restore_state(dump.last_ds, dump.value, dump.unknown_sec);
        }
        for (index, (arc, rra)) in rrd.archives.iter_mut().zip(&self.archives).enumerate() {
            let cdps = &rra.cdp_prep.datasources;
            if cdps.len() != ds_count {
                return Err(inconsistent(format!(
                    "archive {index} has {} accumulators for {ds_count} datasources",
                    cdps.len()
                )));
            }
            for (ds, cdp) in cdps.iter().enumerate() {
                arc.state_mut(ds).restore(cdp.value, cdp.unknown_datapoints);
            }
            for (row_index, row) in rra.database.rows.iter().enumerate() {
                if row.values.len() != ds_count {
                    return Err(inconsistent(format!(
                        "archive {index} row {row_index} has {} values for {ds_count} datasources",
                        row.values.len()
                    )));
                }
                for (ds, &value) in row.values.iter().enumerate() {
                    arc.robin_mut(ds).store(value);
                }
            }
        }
        Ok((def, rrd))
    }

    /// Serializes this dump as an XML document.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Xml`] if serialization fails.
    pub fn to_xml(&self) -> Result<String> {
        let body = quick_xml::se::to_string(self).map_err(FormatError::Xml)?;
        Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{body}\n"))
    }

    /// Parses a dump document.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Xml`] if the document does not match the
    /// dump grammar.
    pub fn from_xml(xml: &str) -> Result<Self> {
        Ok(quick_xml::de::from_str(xml).map_err(FormatError::Xml)?)
    }
}

fn known(value: f64) -> Option<f64> {
    (!value.is_nan()).then_some(value)
}

fn inconsistent(reason: String) -> crate::error::RrdError {
    FormatError::InconsistentDump { reason }.into()
}

impl RrdDatabase {
    /// Captures the whole database as a dump, under the handle's lock.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`](crate::error::RrdError::Closed) after `close()`.
    pub fn dump(&self) -> Result<RrdDump> {
        self.with(|inner| Ok(RrdDump::from_rrd(&inner.rrd)))
    }

    /// Renders the whole database as an XML dump.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`](crate::error::RrdError::Closed) after
    /// `close()`, or [`FormatError::Xml`].
    pub fn dump_xml(&self) -> Result<String> {
        self.dump()?.to_xml()
    }

    /// Writes an XML dump to `xml_path`.
    ///
    /// # Errors
    ///
    /// See [`dump_xml`](Self::dump_xml); also returns I/O errors.
    pub fn export_xml<P: AsRef<Path>>(&self, xml_path: P) -> Result<()> {
        fs::write(xml_path, self.dump_xml()?)?;
        Ok(())
    }

    /// Creates a database at `path` from the XML dump at `xml_path`.
    ///
    /// # Errors
    ///
    /// See [`from_dump`](Self::from_dump); also returns I/O and XML errors.
    pub fn import_xml<P: AsRef<Path>, Q: AsRef<Path>>(path: P, xml_path: Q) -> Result<Self> {
        Self::import_xml_with(path, xml_path, DbOptions::default())
    }

    /// Creates a database at `path` from the XML dump at `xml_path`.
    ///
    /// # Errors
    ///
    /// See [`from_dump`](Self::from_dump); also returns I/O and XML errors.
    pub fn import_xml_with<P: AsRef<Path>, Q: AsRef<Path>>(
        path: P,
        xml_path: Q,
        options: DbOptions,
    ) -> Result<Self> {
        let xml = fs::read_to_string(xml_path)?;
        Self::from_dump(path, &RrdDump::from_xml(&xml)?, options)
    }

    /// Creates a database at `path` from a parsed dump.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::DumpVersion`] or
    /// [`FormatError::InconsistentDump`] for an unusable dump, a
    /// [`ValidationError`](crate::error::ValidationError) for invalid
    /// definitions, or the errors of [`create_with`](Self::create_with).
    pub fn from_dump<P: AsRef<Path>>(path: P, dump: &RrdDump, options: DbOptions) -> Result<Self> {
        let path = path.as_ref();
        let (_, rrd) = dump.to_rrd(path)?;
        Self::create_from(path, rrd, options)
    }
}
