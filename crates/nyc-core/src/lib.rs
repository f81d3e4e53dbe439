//! Core domain model for the NYC housing sync pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "nyc-core";

/// Residential PLUTO land-use codes (one/two family, walk-up, elevator buildings).
pub const RESIDENTIAL_LAND_USE: [&str; 3] = ["01", "02", "03"];

/// Normalize a raw ZIP value into the 5-character zero-padded form.
///
/// Numeric renderings such as `"10001.0"` (as produced by float-typed sources)
/// collapse to their integer part before padding.
pub fn normalize_zip(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
            return Some(format!("{:05}", value as u64));
        }
    }
    Some(format!("{trimmed:0>5}"))
}

/// Lenient numeric coercion: anything that does not parse to a finite number is missing.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousingMetric {
    pub zip: String,
    pub name: Option<String>,
    pub median_rent: Option<f64>,
    /// Monthly figure: the ACS annual median divided by 12.
    pub median_income: Option<f64>,
    pub rent_burden: Option<f64>,
    pub rent_burden_rate: Option<f64>,
    pub housing_units: Option<i64>,
    pub total_units: Option<i64>,
    pub occupied_units: Option<i64>,
    pub vacant_units: Option<i64>,
    pub vacancy_rate: Option<f64>,
}

/// One PLUTO tax lot, keyed by BBL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingRecord {
    pub bbl: String,
    pub landuse: Option<String>,
    pub yearbuilt: Option<i32>,
    pub numfloors: Option<f64>,
    pub unitsres: Option<i64>,
    pub address: Option<String>,
    pub zipcode: Option<String>,
    pub borough: Option<String>,
}

/// Per-ZIP rollup derived from [`BuildingRecord`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingStats {
    pub zip: String,
    pub total_buildings: i64,
    pub avg_floors: Option<f64>,
    pub avg_year_built: Option<i32>,
    pub total_residential_units: i64,
    pub buildings_pre_1950: i64,
    pub buildings_1950_2000: i64,
    pub buildings_post_2000: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    ZipList,
    FullSync,
    CsvLoad,
    PlutoSync,
    PlutoCsvLoad,
}

impl SyncType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZipList => "zip_list",
            Self::FullSync => "full_sync",
            Self::CsvLoad => "csv_load",
            Self::PlutoSync => "pluto_sync",
            Self::PlutoCsvLoad => "pluto_csv_load",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zip_list" | "nyc_zip_list" => Ok(Self::ZipList),
            "full_sync" => Ok(Self::FullSync),
            "csv_load" => Ok(Self::CsvLoad),
            "pluto_sync" => Ok(Self::PlutoSync),
            "pluto_csv_load" => Ok(Self::PlutoCsvLoad),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Append-only audit record written once per sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub records_processed: i64,
    pub error_message: Option<String>,
    pub sync_time: DateTime<Utc>,
}

/// The two independently scheduled data domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDomain {
    Census,
    Buildings,
}

impl fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Census => f.write_str("census"),
            Self::Buildings => f.write_str("buildings"),
        }
    }
}

/// Persisted auto-sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSyncConfig {
    pub enabled: bool,
    pub interval_hours: u32,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_census: bool,
    pub sync_pluto: bool,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: 24,
            last_sync: None,
            sync_census: true,
            sync_pluto: false,
        }
    }
}

impl AutoSyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::hours(i64::from(self.interval_hours))
    }

    /// Whether a scheduled run is due at `now`. Disabled configs are never due.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_sync {
            None => true,
            Some(last) => now - last >= self.interval(),
        }
    }

    pub fn next_sync(&self) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        self.last_sync.map(|last| last + self.interval())
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSyncConfigUpdate {
    pub enabled: Option<bool>,
    pub interval_hours: Option<u32>,
    pub sync_census: Option<bool>,
    pub sync_pluto: Option<bool>,
}

impl AutoSyncConfigUpdate {
    pub fn apply(&self, config: &mut AutoSyncConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(hours) = self.interval_hours {
            config.interval_hours = hours;
        }
        if let Some(census) = self.sync_census {
            config.sync_census = census;
        }
        if let Some(pluto) = self.sync_pluto {
            config.sync_pluto = pluto;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.interval_hours.is_none()
            && self.sync_census.is_none()
            && self.sync_pluto.is_none()
    }
}

// Accepts RFC 3339 as well as offset-less ISO-8601 (read as UTC).
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn zip_normalization_pads_and_strips_float_suffix() {
        assert_eq!(normalize_zip("501").as_deref(), Some("00501"));
        assert_eq!(normalize_zip("10001.0").as_deref(), Some("10001"));
        assert_eq!(normalize_zip(" 11201 ").as_deref(), Some("11201"));
        assert_eq!(normalize_zip(""), None);
    }

    #[test]
    fn parse_number_treats_garbage_as_missing() {
        assert_eq!(parse_number("1234"), Some(1234.0));
        assert_eq!(parse_number("-666666666"), Some(-666_666_666.0));
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn sync_type_round_trips_through_str() {
        for ty in [
            SyncType::ZipList,
            SyncType::FullSync,
            SyncType::CsvLoad,
            SyncType::PlutoSync,
            SyncType::PlutoCsvLoad,
        ] {
            assert_eq!(ty.as_str().parse::<SyncType>(), Ok(ty));
        }
        assert!("bogus".parse::<SyncType>().is_err());
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg: AutoSyncConfig = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.interval_hours, 24);
        assert!(cfg.sync_census);
        assert!(!cfg.sync_pluto);
        assert_eq!(cfg.last_sync, None);
    }

    #[test]
    fn config_accepts_naive_and_rfc3339_timestamps() {
        let naive: AutoSyncConfig =
            serde_json::from_str(r#"{"last_sync": "2025-03-01T08:30:00.123456"}"#).unwrap();
        let rfc: AutoSyncConfig =
            serde_json::from_str(r#"{"last_sync": "2025-03-01T08:30:00Z"}"#).unwrap();
        assert_eq!(
            rfc.last_sync,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap())
        );
        assert_eq!(
            naive.last_sync.map(|t| t.date_naive()),
            rfc.last_sync.map(|t| t.date_naive())
        );
    }

    #[test]
    fn next_sync_requires_enabled_and_last_sync() {
        let last = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let mut cfg = AutoSyncConfig {
            last_sync: Some(last),
            ..Default::default()
        };
        assert_eq!(cfg.next_sync(), None);
        cfg.enabled = true;
        assert_eq!(cfg.next_sync(), Some(last + Duration::hours(24)));
    }

    #[test]
    fn update_only_touches_provided_fields() {
        let mut cfg = AutoSyncConfig::default();
        AutoSyncConfigUpdate {
            interval_hours: Some(6),
            sync_pluto: Some(true),
            ..Default::default()
        }
        .apply(&mut cfg);
        assert!(!cfg.enabled);
        assert_eq!(cfg.interval_hours, 6);
        assert!(cfg.sync_census);
        assert!(cfg.sync_pluto);
    }
}
