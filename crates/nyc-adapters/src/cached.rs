use std::collections::HashSet;

use async_trait::async_trait;
use nyc_core::{BuildingRecord, SyncDomain};
use nyc_storage::{CacheDir, WrittenFile};
use tracing::info;

use crate::{
    AdapterError, CensusDataset, CensusRow, CensusTable, HousingSource, PlutoQuery, RawBuilding,
    SourceKind, PLUTO_FIELDS,
};

pub const ZIP_LIST_FILE: &str = "nyc_zip_list.csv";
pub const PLUTO_FILE: &str = "pluto_residential.csv";

fn census_files() -> Vec<&'static str> {
    std::iter::once(ZIP_LIST_FILE)
        .chain(CensusDataset::ALL.iter().map(|d| d.file_name()))
        .collect()
}

/// Source reading the flat files written by a previous cache refresh.
#[derive(Debug, Clone)]
pub struct CachedSource {
    cache: CacheDir,
}

impl CachedSource {
    pub fn new(cache: CacheDir) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &CacheDir {
        &self.cache
    }

    pub fn has_census_files(&self) -> bool {
        self.cache.missing(&census_files()).is_empty()
    }

    pub fn has_building_file(&self) -> bool {
        self.cache.exists(PLUTO_FILE)
    }
}

#[async_trait]
impl HousingSource for CachedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Cached
    }

    async fn preflight(&self, domain: SyncDomain) -> Result<(), AdapterError> {
        let names = match domain {
            SyncDomain::Census => census_files(),
            SyncDomain::Buildings => vec![PLUTO_FILE],
        };
        match self.cache.missing(&names).into_iter().next() {
            Some(path) => Err(AdapterError::MissingFile(path)),
            None => Ok(()),
        }
    }

    async fn zip_list(&self) -> Result<Vec<String>, AdapterError> {
        read_zip_list(&self.cache).await
    }

    async fn census_tables(&self) -> Result<Vec<CensusTable>, AdapterError> {
        let mut tables = Vec::with_capacity(CensusDataset::ALL.len());
        for dataset in CensusDataset::ALL {
            tables.push(read_census_table(&self.cache, dataset).await?);
        }
        Ok(tables)
    }

    // The cached file is a snapshot of an earlier filtered pull; query filters do not apply.
    async fn buildings(&self, _query: &PlutoQuery) -> Result<Vec<BuildingRecord>, AdapterError> {
        read_buildings(&self.cache).await
    }
}

async fn read_csv(
    cache: &CacheDir,
    name: &str,
) -> Result<csv::Reader<std::io::Cursor<Vec<u8>>>, AdapterError> {
    if !cache.exists(name) {
        return Err(AdapterError::MissingFile(cache.path(name)));
    }
    let bytes = cache.read_file(name).await?;
    Ok(csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(std::io::Cursor::new(bytes)))
}

fn csv_error(name: &str) -> impl Fn(csv::Error) -> AdapterError + '_ {
    move |source| AdapterError::Csv {
        file: name.to_string(),
        source,
    }
}

fn header_index(
    headers: &csv::StringRecord,
    name: &str,
    file: &str,
) -> Result<usize, AdapterError> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| AdapterError::Shape(format!("{file} has no `{name}` column")))
}

pub async fn read_zip_list(cache: &CacheDir) -> Result<Vec<String>, AdapterError> {
    let mut reader = read_csv(cache, ZIP_LIST_FILE).await?;
    let headers = reader.headers().map_err(csv_error(ZIP_LIST_FILE))?.clone();
    let zip_idx = header_index(&headers, "zip", ZIP_LIST_FILE)?;

    let mut seen = HashSet::new();
    let mut zips = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error(ZIP_LIST_FILE))?;
        if let Some(zip) = record.get(zip_idx).and_then(nyc_core::normalize_zip) {
            if seen.insert(zip.clone()) {
                zips.push(zip);
            }
        }
    }
    zips.sort();
    Ok(zips)
}

pub async fn read_census_table(
    cache: &CacheDir,
    dataset: CensusDataset,
) -> Result<CensusTable, AdapterError> {
    let file = dataset.file_name();
    let mut reader = read_csv(cache, file).await?;
    let headers = reader.headers().map_err(csv_error(file))?.clone();
    let zip_idx = header_index(&headers, "zip", file)?;
    let name_idx = headers.iter().position(|h| h.trim() == "NAME");
    let value_idx = dataset
        .variables()
        .iter()
        .map(|v| header_index(&headers, v.column, file))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error(file))?;
        let Some(zip) = record.get(zip_idx).and_then(nyc_core::normalize_zip) else {
            continue;
        };
        rows.push(CensusRow {
            zip,
            name: name_idx
                .and_then(|idx| record.get(idx))
                .map(str::to_string)
                .filter(|s| !s.is_empty()),
            values: value_idx
                .iter()
                .map(|idx| record.get(*idx).and_then(nyc_core::parse_number))
                .collect(),
        });
    }
    info!(file, rows = rows.len(), "read cached census table");
    Ok(CensusTable { dataset, rows })
}

pub async fn read_buildings(cache: &CacheDir) -> Result<Vec<BuildingRecord>, AdapterError> {
    let mut reader = read_csv(cache, PLUTO_FILE).await?;
    let headers = reader.headers().map_err(csv_error(PLUTO_FILE))?.clone();
    header_index(&headers, "bbl", PLUTO_FILE)?;

    let mut records = Vec::new();
    for raw in reader.deserialize::<RawBuilding>() {
        let raw = raw.map_err(csv_error(PLUTO_FILE))?;
        records.extend(raw.into_record());
    }
    info!(records = records.len(), "read cached PLUTO buildings");
    Ok(records)
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, AdapterError> {
    writer
        .into_inner()
        .map_err(|err| AdapterError::Io(err.into_error()))
}

fn format_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn zip_list_csv(zips: &[String]) -> Result<Vec<u8>, AdapterError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let to_err = csv_error(ZIP_LIST_FILE);
    writer.write_record(["zip"]).map_err(&to_err)?;
    for zip in zips {
        writer.write_record([zip.as_str()]).map_err(&to_err)?;
    }
    finish(writer)
}

/// Serialize a census table with the same columns the cached reader expects.
pub fn census_table_csv(table: &CensusTable) -> Result<Vec<u8>, AdapterError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let to_err = csv_error(table.dataset.file_name());
    let header = ["zip", "NAME"]
        .into_iter()
        .chain(table.columns())
        .collect::<Vec<_>>();
    writer.write_record(&header).map_err(&to_err)?;
    for row in &table.rows {
        let mut fields = vec![row.zip.clone(), row.name.clone().unwrap_or_default()];
        fields.extend(row.values.iter().map(|v| format_number(*v)));
        writer.write_record(&fields).map_err(&to_err)?;
    }
    finish(writer)
}

pub fn buildings_csv(records: &[BuildingRecord]) -> Result<Vec<u8>, AdapterError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let to_err = csv_error(PLUTO_FILE);
    writer.write_record(PLUTO_FIELDS).map_err(&to_err)?;
    for b in records {
        writer
            .write_record([
                b.bbl.clone(),
                b.landuse.clone().unwrap_or_default(),
                b.yearbuilt.map(|v| v.to_string()).unwrap_or_default(),
                format_number(b.numfloors),
                b.unitsres.map(|v| v.to_string()).unwrap_or_default(),
                b.address.clone().unwrap_or_default(),
                b.zipcode.clone().unwrap_or_default(),
                b.borough.clone().unwrap_or_default(),
            ])
            .map_err(&to_err)?;
    }
    finish(writer)
}

/// Write a full cache snapshot. Census tables are restricted to `zips` first;
/// `buildings` is optional so a refresh can skip the PLUTO pull.
pub async fn write_cache_snapshot(
    cache: &CacheDir,
    zips: &[String],
    tables: &[CensusTable],
    buildings: Option<&[BuildingRecord]>,
) -> Result<Vec<WrittenFile>, AdapterError> {
    let nyc: HashSet<&str> = zips.iter().map(String::as_str).collect();
    let mut written = vec![cache.write_file(ZIP_LIST_FILE, &zip_list_csv(zips)?).await?];

    for table in tables {
        let filtered = table.filtered(|zip| nyc.contains(zip));
        let bytes = census_table_csv(&filtered)?;
        written.push(cache.write_file(table.dataset.file_name(), &bytes).await?);
    }
    if let Some(buildings) = buildings {
        written.push(cache.write_file(PLUTO_FILE, &buildings_csv(buildings)?).await?);
    }
    cache.write_manifest(&written).await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_census_response;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn fixtures() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    fn live_table(dataset: CensusDataset) -> CensusTable {
        let name = match dataset {
            CensusDataset::Rent => "rent.json",
            CensusDataset::Income => "income.json",
            CensusDataset::Burden => "burden.json",
            CensusDataset::Housing => "housing.json",
            CensusDataset::Vacancy => "vacancy.json",
        };
        let text = std::fs::read_to_string(fixtures().join("census").join(name)).unwrap();
        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(&text).unwrap();
        parse_census_response(dataset, &rows).unwrap()
    }

    #[tokio::test]
    async fn reads_fixture_cache() {
        let source = CachedSource::new(CacheDir::new(fixtures().join("cache")));
        assert!(source.has_census_files());
        assert!(source.has_building_file());

        let zips = source.zip_list().await.unwrap();
        assert_eq!(zips, ["10001", "10002", "10003", "11201"]);

        let tables = source.census_tables().await.unwrap();
        assert_eq!(tables.len(), 5);
        let rent = &tables[0];
        assert!(rent.rows.iter().any(|r| r.zip == "00501"));

        let buildings = source.buildings(&PlutoQuery::default()).await.unwrap();
        assert_eq!(buildings.len(), 5);
        assert_eq!(buildings[0].landuse.as_deref(), Some("03"));
        assert_eq!(buildings[4].zipcode, None);
    }

    #[tokio::test]
    async fn vacancy_reader_ignores_extra_columns() {
        let cache = CacheDir::new(fixtures().join("cache"));
        let table = read_census_table(&cache, CensusDataset::Vacancy).await.unwrap();
        assert_eq!(table.rows[0].values, vec![Some(15000.0), Some(13500.0), Some(1500.0)]);
    }

    #[tokio::test]
    async fn preflight_reports_missing_files_before_reading() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(ZIP_LIST_FILE), "zip\n10001\n").unwrap();
        let source = CachedSource::new(CacheDir::new(dir.path()));

        let err = source.preflight(SyncDomain::Census).await.unwrap_err();
        assert!(matches!(err, AdapterError::MissingFile(ref p) if p.ends_with("nyc_rent.csv")));
        let err = source.preflight(SyncDomain::Buildings).await.unwrap_err();
        assert!(matches!(err, AdapterError::MissingFile(ref p) if p.ends_with(PLUTO_FILE)));
    }

    #[tokio::test]
    async fn missing_column_is_a_shape_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("nyc_rent.csv"), "zip,NAME\n10001,x\n").unwrap();
        let err = read_census_table(&CacheDir::new(dir.path()), CensusDataset::Rent)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Shape(_)));
    }

    #[tokio::test]
    async fn snapshot_reads_back_as_the_live_tables() {
        let dir = tempdir().unwrap();
        let cache = CacheDir::new(dir.path());
        let zips: Vec<String> = ["10001", "10002", "10003", "11201"]
            .into_iter()
            .map(String::from)
            .collect();
        let live: Vec<_> = CensusDataset::ALL.into_iter().map(live_table).collect();
        let buildings = read_buildings(&CacheDir::new(fixtures().join("cache"))).await.unwrap();

        let written = write_cache_snapshot(&cache, &zips, &live, Some(&buildings))
            .await
            .unwrap();
        assert_eq!(written.len(), 7);
        assert!(cache.exists(nyc_storage::MANIFEST_FILE));

        let source = CachedSource::new(cache);
        assert_eq!(source.zip_list().await.unwrap(), zips);
        let cached = source.census_tables().await.unwrap();
        for (live, cached) in live.iter().zip(&cached) {
            let expected = live.filtered(|zip| zips.iter().any(|z| z == zip));
            assert_eq!(&expected, cached);
        }
        assert_eq!(source.buildings(&PlutoQuery::default()).await.unwrap(), buildings);
    }
}
