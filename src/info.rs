//! Image identification and spacecraft metadata.
//!
//! [ImageInfo] travels with assembled images and live composites. The
//! [SpacecraftTable] resolves a spacecraft id voted out of recurring telemetry
//! fields into the `sat_info.json` sidecar later stages use to find orbital
//! parameters.
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    hash::Hash,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::Result;

pub type Scid = u16;

/// Descriptive metadata attached to an assembled image or live composite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageInfo {
    pub is_sat: bool,
    pub sat_name: String,
    pub sat_prefix: String,
    pub region: String,
    pub channel: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Image originates from the previous generation of the series.
    pub legacy_series: bool,
}

impl ImageInfo {
    /// Deterministic output file stem, e.g. `G16_FD_13_20240101T120000Z`.
    ///
    /// Empty parts are skipped.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let time = self
            .timestamp
            .map(|t| t.format("%Y%m%dT%H%M%SZ").to_string())
            .unwrap_or_default();
        [
            self.sat_prefix.as_str(),
            self.region.as_str(),
            self.channel.as_str(),
            time.as_str(),
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.replace(['/', '\\', ' '], "-"))
        .collect::<Vec<_>>()
        .join("_")
    }
}

/// Return the most frequent value, or `None` if there are no values.
///
/// Ties go to the value that reached the winning count first.
pub fn most_common<T, I>(values: I) -> Option<T>
where
    T: Hash + Eq + Copy,
    I: IntoIterator<Item = T>,
{
    let mut counts: HashMap<T, usize> = HashMap::default();
    let mut best: Option<(T, usize)> = None;
    for v in values {
        let count = counts.entry(v).or_default();
        *count += 1;
        match best {
            Some((_, n)) if n >= *count => (),
            _ => best = Some((v, *count)),
        }
    }
    best.map(|(v, _)| v)
}

/// Sidecar descriptor identifying the spacecraft a product came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpacecraftInfo {
    pub scid: Scid,
    pub name: String,
    pub norad: u32,
}

impl SpacecraftInfo {
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const FILENAME: &'static str = "sat_info.json";

    #[must_use]
    pub fn is_known(&self) -> bool {
        self.name != Self::UNKNOWN
    }

    /// Write `sat_info.json` into `directory`, returning the path written.
    pub fn save<P: AsRef<Path>>(&self, directory: P) -> Result<PathBuf> {
        let path = directory.as_ref().join(Self::FILENAME);
        serde_json::to_writer_pretty(File::create(&path)?, self)?;
        Ok(path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_reader(File::open(path)?)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableFile {
    spacecrafts: Vec<SpacecraftInfo>,
}

/// Known spacecraft, keyed by the id found in telemetry.
///
/// # Example
/// ```
/// use satproducts::info::SpacecraftTable;
///
/// let table = SpacecraftTable::default();
/// let sc = table.identify([13, 13, 7, 13]);
/// assert_eq!(sc.name, "NOAA-18");
/// assert_eq!(sc.norad, 28654);
/// ```
#[derive(Debug, Clone)]
pub struct SpacecraftTable {
    spacecrafts: Vec<SpacecraftInfo>,
}

impl Default for SpacecraftTable {
    fn default() -> Self {
        Self {
            spacecrafts: builtin(),
        }
    }
}

fn builtin() -> Vec<SpacecraftInfo> {
    [(7, "NOAA-15", 25338), (13, "NOAA-18", 28654), (15, "NOAA-19", 33591)]
        .into_iter()
        .map(|(scid, name, norad)| SpacecraftInfo {
            scid,
            name: name.to_string(),
            norad,
        })
        .collect()
}

impl SpacecraftTable {
    /// Load a table from a JSON file of the form `{"spacecrafts": [...]}`.
    ///
    /// With `built_in` the built-in entries are appended for any id the file does
    /// not define.
    pub fn with_file<P: AsRef<Path>>(path: P, built_in: bool) -> Result<Self> {
        let mut table: TableFile = serde_json::from_reader(File::open(path)?)?;
        if built_in {
            let file_ids: HashSet<Scid> = table.spacecrafts.iter().map(|sc| sc.scid).collect();
            for sc in builtin() {
                // skip any that already exist from the file
                if file_ids.contains(&sc.scid) {
                    continue;
                }
                table.spacecrafts.push(sc);
            }
        }
        Ok(Self {
            spacecrafts: table.spacecrafts,
        })
    }

    #[must_use]
    pub fn all(&self) -> &[SpacecraftInfo] {
        &self.spacecrafts
    }

    #[must_use]
    pub fn lookup(&self, scid: Scid) -> Option<&SpacecraftInfo> {
        self.spacecrafts.iter().find(|sc| sc.scid == scid)
    }

    /// Identify the spacecraft by majority vote over per-line spacecraft ids.
    ///
    /// An unrecognised id is not an error; the result is tagged
    /// [SpacecraftInfo::UNKNOWN] so processing can continue.
    pub fn identify<I: IntoIterator<Item = Scid>>(&self, ids: I) -> SpacecraftInfo {
        let scid = most_common(ids);
        match scid.and_then(|id| self.lookup(id)) {
            Some(sc) => {
                info!(scid = sc.scid, name = %sc.name, "identified spacecraft");
                sc.clone()
            }
            None => {
                warn!(?scid, "unknown spacecraft; tagging as {}", SpacecraftInfo::UNKNOWN);
                SpacecraftInfo {
                    scid: scid.unwrap_or_default(),
                    name: SpacecraftInfo::UNKNOWN.to_string(),
                    norad: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_most_common() {
        assert_eq!(most_common([1, 2, 2, 3]), Some(2));
        assert_eq!(most_common(Vec::<u16>::new()), None);
        // tie goes to first to reach the count
        assert_eq!(most_common([4, 5, 5, 4]), Some(5));
    }

    #[test]
    fn identify_known() {
        let table = SpacecraftTable::default();
        let sc = table.identify([15, 15, 15, 3]);
        assert_eq!(sc.scid, 15);
        assert_eq!(sc.name, "NOAA-19");
        assert_eq!(sc.norad, 33591);
        assert!(sc.is_known());
    }

    #[test]
    fn identify_unknown() {
        let table = SpacecraftTable::default();
        let sc = table.identify([2, 2, 9]);
        assert_eq!(sc.scid, 2);
        assert_eq!(sc.name, SpacecraftInfo::UNKNOWN);
        assert_eq!(sc.norad, 0);
        assert!(!sc.is_known());

        let sc = table.identify([]);
        assert!(!sc.is_known());
    }

    #[test]
    fn sidecar_roundtrip() {
        let tmpdir = tempfile::tempdir().unwrap();
        let sc = SpacecraftTable::default().identify([7]);
        let path = sc.save(tmpdir.path()).unwrap();
        assert!(path.ends_with(SpacecraftInfo::FILENAME));
        assert_eq!(SpacecraftInfo::load(&path).unwrap(), sc);
    }

    #[test]
    fn with_file() {
        let tmpdir = tempfile::tempdir().unwrap();
        let out_path = tmpdir.path().join("spacecrafts.json");
        fs::write(
            &out_path,
            r#"{"spacecrafts": [{"scid": 13, "name": "custom-18", "norad": 1}]}"#,
        )
        .unwrap();

        let table = SpacecraftTable::with_file(&out_path, false).unwrap();
        assert_eq!(table.all().len(), 1, "Should only be 1 spacecraft");

        let table = SpacecraftTable::with_file(&out_path, true).unwrap();
        assert_eq!(table.all().len(), 3);
        assert_eq!(table.lookup(13).unwrap().name, "custom-18");
    }

    #[test]
    fn file_stem() {
        let info = ImageInfo {
            is_sat: true,
            sat_name: "GOES-16".into(),
            sat_prefix: "G16".into(),
            region: "Full Disk".into(),
            channel: "13".into(),
            timestamp: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            legacy_series: false,
        };
        assert_eq!(info.file_stem(), "G16_Full-Disk_13_20240102T030405Z");

        let info = ImageInfo {
            channel: "2".into(),
            ..Default::default()
        };
        assert_eq!(info.file_stem(), "2");
    }
}
