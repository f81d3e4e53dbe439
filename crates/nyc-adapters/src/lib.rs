//! Upstream data adapters: Census ACS, NYC Open Data (Socrata) and the cached flat files.

use std::path::PathBuf;

use async_trait::async_trait;
use nyc_core::{BuildingRecord, SyncDomain};
use nyc_storage::FetchError;
use serde_json::Value as JsonValue;
use thiserror::Error;

mod cached;
mod census;
mod socrata;

pub use cached::{
    buildings_csv, census_table_csv, read_buildings, read_census_table, read_zip_list,
    write_cache_snapshot, zip_list_csv, CachedSource, PLUTO_FILE, ZIP_LIST_FILE,
};
pub use census::{parse_census_response, CensusClient, DEFAULT_ACS_YEAR};
pub use socrata::{
    paginate, parse_building_page, parse_zip_list, PlutoQuery, SocrataClient, PLUTO_FIELDS,
};

pub const CRATE_NAME: &str = "nyc-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("cached file not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("parsing {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Shape(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Where a source's tables come from; decides which audit log type a sync records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Live,
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CensusVariable {
    pub code: &'static str,
    pub column: &'static str,
}

/// The five ACS tables pulled per ZCTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CensusDataset {
    Rent,
    Income,
    Burden,
    Housing,
    Vacancy,
}

impl CensusDataset {
    pub const ALL: [Self; 5] = [
        Self::Rent,
        Self::Income,
        Self::Burden,
        Self::Housing,
        Self::Vacancy,
    ];

    pub fn variables(self) -> &'static [CensusVariable] {
        match self {
            Self::Rent => &[CensusVariable {
                code: "B25064_001E",
                column: "median_rent",
            }],
            Self::Income => &[CensusVariable {
                code: "B19013_001E",
                column: "median_income",
            }],
            Self::Burden => &[CensusVariable {
                code: "B25070_001E",
                column: "rent_burden",
            }],
            Self::Housing => &[CensusVariable {
                code: "B25001_001E",
                column: "housing_units",
            }],
            Self::Vacancy => &[
                CensusVariable {
                    code: "B25002_001E",
                    column: "total_units",
                },
                CensusVariable {
                    code: "B25002_002E",
                    column: "occupied_units",
                },
                CensusVariable {
                    code: "B25002_003E",
                    column: "vacant_units",
                },
            ],
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Rent => "nyc_rent.csv",
            Self::Income => "nyc_income.csv",
            Self::Burden => "nyc_burden.csv",
            Self::Housing => "nyc_housing.csv",
            Self::Vacancy => "nyc_vacancy.csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CensusRow {
    pub zip: String,
    pub name: Option<String>,
    /// Aligned with [`CensusDataset::variables`].
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CensusTable {
    pub dataset: CensusDataset,
    pub rows: Vec<CensusRow>,
}

impl CensusTable {
    pub fn columns(&self) -> impl Iterator<Item = &'static str> {
        self.dataset.variables().iter().map(|v| v.column)
    }

    /// Copy of the table keeping only rows whose ZIP passes `keep`.
    pub fn filtered(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self {
            dataset: self.dataset,
            rows: self
                .rows
                .iter()
                .filter(|row| keep(&row.zip))
                .cloned()
                .collect(),
        }
    }
}

/// Raw, string-typed building fields as delivered by Socrata or the cached CSV.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct RawBuilding {
    pub bbl: Option<String>,
    pub landuse: Option<String>,
    pub yearbuilt: Option<String>,
    pub numfloors: Option<String>,
    pub unitsres: Option<String>,
    pub address: Option<String>,
    pub zipcode: Option<String>,
    pub borough: Option<String>,
}

impl RawBuilding {
    /// Coerce into a typed record; unparsable numbers become missing.
    /// Rows without a BBL are dropped.
    pub fn into_record(self) -> Option<BuildingRecord> {
        let bbl = text_or_none(self.bbl)?;
        Some(BuildingRecord {
            bbl,
            landuse: text_or_none(self.landuse),
            yearbuilt: number(self.yearbuilt.as_deref()).map(|v| v as i32),
            numfloors: number(self.numfloors.as_deref()),
            unitsres: number(self.unitsres.as_deref()).map(|v| v as i64),
            address: text_or_none(self.address),
            zipcode: self.zipcode.as_deref().and_then(nyc_core::normalize_zip),
            borough: text_or_none(self.borough),
        })
    }
}

fn number(raw: Option<&str>) -> Option<f64> {
    raw.and_then(nyc_core::parse_number)
}

fn text_or_none(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Stringify a JSON cell the way the upstream APIs intend it: text as-is, numbers rendered.
pub(crate) fn json_cell(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// A provider of the raw tables one sync consumes.
#[async_trait]
pub trait HousingSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Verify every input for `domain` is reachable before any destructive write.
    async fn preflight(&self, _domain: SyncDomain) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn zip_list(&self) -> Result<Vec<String>, AdapterError>;

    async fn census_tables(&self) -> Result<Vec<CensusTable>, AdapterError>;

    async fn buildings(&self, query: &PlutoQuery) -> Result<Vec<BuildingRecord>, AdapterError>;
}

/// Live HTTP source backed by the Census and Socrata clients.
#[derive(Debug, Clone)]
pub struct LiveSource {
    pub census: CensusClient,
    pub socrata: SocrataClient,
}

impl LiveSource {
    pub fn new(census: CensusClient, socrata: SocrataClient) -> Self {
        Self { census, socrata }
    }
}

#[async_trait]
impl HousingSource for LiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    async fn zip_list(&self) -> Result<Vec<String>, AdapterError> {
        self.socrata.fetch_zip_list().await
    }

    async fn census_tables(&self) -> Result<Vec<CensusTable>, AdapterError> {
        self.census.fetch_all().await
    }

    async fn buildings(&self, query: &PlutoQuery) -> Result<Vec<BuildingRecord>, AdapterError> {
        self.socrata.fetch_buildings(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_building_coerces_and_pads() {
        let raw = RawBuilding {
            bbl: Some("1003450010".into()),
            landuse: Some("02".into()),
            yearbuilt: Some("1931".into()),
            numfloors: Some("6.5".into()),
            unitsres: Some("not a number".into()),
            address: Some("  ".into()),
            zipcode: Some("10002.0".into()),
            borough: Some("MN".into()),
        };
        let record = raw.into_record().unwrap();
        assert_eq!(record.landuse.as_deref(), Some("02"));
        assert_eq!(record.yearbuilt, Some(1931));
        assert_eq!(record.numfloors, Some(6.5));
        assert_eq!(record.unitsres, None);
        assert_eq!(record.address, None);
        assert_eq!(record.zipcode.as_deref(), Some("10002"));
    }

    #[test]
    fn raw_building_without_bbl_is_dropped() {
        assert!(RawBuilding::default().into_record().is_none());
    }

    #[test]
    fn vacancy_dataset_carries_three_columns() {
        let cols: Vec<_> = CensusDataset::Vacancy
            .variables()
            .iter()
            .map(|v| v.column)
            .collect();
        assert_eq!(cols, ["total_units", "occupied_units", "vacant_units"]);
    }
}
