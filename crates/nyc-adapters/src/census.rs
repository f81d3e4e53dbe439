use std::time::Duration;

use nyc_storage::{FetchRequest, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::{json_cell, AdapterError, CensusDataset, CensusRow, CensusTable};

pub const DEFAULT_ACS_YEAR: &str = "2022";

const ZCTA_COLUMN: &str = "zip code tabulation area";
const NAME_COLUMN: &str = "NAME";
const CENSUS_TIMEOUT: Duration = Duration::from_secs(90);

/// ACS 5-year client, one request per dataset across every ZCTA.
#[derive(Debug, Clone)]
pub struct CensusClient {
    fetcher: HttpFetcher,
    base_url: String,
    timeout: Duration,
}

impl CensusClient {
    pub fn new(fetcher: HttpFetcher, acs_year: &str) -> Self {
        Self {
            fetcher,
            base_url: format!("https://api.census.gov/data/{acs_year}/acs/acs5"),
            timeout: CENSUS_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request_for(&self, dataset: CensusDataset) -> FetchRequest {
        let codes = dataset
            .variables()
            .iter()
            .map(|v| v.code)
            .collect::<Vec<_>>()
            .join(",");
        FetchRequest::get(&self.base_url)
            .query("get", format!("{NAME_COLUMN},{codes}"))
            .query("for", format!("{ZCTA_COLUMN}:*"))
            .timeout(self.timeout)
    }

    pub async fn fetch_table(&self, dataset: CensusDataset) -> Result<CensusTable, AdapterError> {
        let rows: Vec<Vec<JsonValue>> = self.fetcher.fetch_json(&self.request_for(dataset)).await?;
        let table = parse_census_response(dataset, &rows)?;
        info!(?dataset, rows = table.rows.len(), "fetched census table");
        Ok(table)
    }

    pub async fn fetch_all(&self) -> Result<Vec<CensusTable>, AdapterError> {
        let mut tables = Vec::with_capacity(CensusDataset::ALL.len());
        for dataset in CensusDataset::ALL {
            tables.push(self.fetch_table(dataset).await?);
        }
        Ok(tables)
    }
}

/// Decode the ACS array-of-arrays payload: first row is the header.
pub fn parse_census_response(
    dataset: CensusDataset,
    rows: &[Vec<JsonValue>],
) -> Result<CensusTable, AdapterError> {
    let (header, body) = rows
        .split_first()
        .ok_or_else(|| AdapterError::Shape("empty census response".to_string()))?;
    let header = header.iter().map(json_cell).collect::<Vec<_>>();
    let position = |name: &str| header.iter().position(|h| h.as_deref() == Some(name));

    let zip_idx = position(ZCTA_COLUMN)
        .ok_or_else(|| AdapterError::Shape(format!("census response missing `{ZCTA_COLUMN}`")))?;
    let name_idx = position(NAME_COLUMN);
    let value_idx = dataset
        .variables()
        .iter()
        .map(|v| {
            position(v.code).ok_or_else(|| {
                AdapterError::Shape(format!("census response missing variable `{}`", v.code))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let cell = |row: &[JsonValue], idx: usize| row.get(idx).and_then(json_cell);

    let rows = body
        .iter()
        .filter_map(|row| {
            let zip = cell(row, zip_idx).as_deref().and_then(nyc_core::normalize_zip)?;
            Some(CensusRow {
                zip,
                name: name_idx.and_then(|idx| cell(row, idx)),
                values: value_idx
                    .iter()
                    .map(|idx| cell(row, *idx).as_deref().and_then(nyc_core::parse_number))
                    .collect(),
            })
        })
        .collect();

    Ok(CensusTable { dataset, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nyc_storage::HttpClientConfig;
    use std::path::{Path, PathBuf};

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/census")
            .join(name)
    }

    fn load(name: &str) -> Vec<Vec<JsonValue>> {
        serde_json::from_str(&std::fs::read_to_string(fixture(name)).unwrap()).unwrap()
    }

    #[test]
    fn parses_header_and_pads_zip() {
        let table = parse_census_response(CensusDataset::Rent, &load("rent.json")).unwrap();
        assert_eq!(table.rows.len(), 4);
        let padded = table.rows.iter().find(|r| r.zip == "00501").unwrap();
        assert_eq!(padded.values, vec![Some(900.0)]);
        assert_eq!(table.rows[0].name.as_deref(), Some("ZCTA5 10001"));
    }

    #[test]
    fn keeps_sentinels_raw_for_the_reconciler() {
        let table = parse_census_response(CensusDataset::Income, &load("income.json")).unwrap();
        let row = table.rows.iter().find(|r| r.zip == "10002").unwrap();
        assert_eq!(row.values, vec![Some(-666_666_666.0)]);
    }

    #[test]
    fn multi_variable_columns_follow_dataset_order() {
        let table = parse_census_response(CensusDataset::Vacancy, &load("vacancy.json")).unwrap();
        assert_eq!(table.rows[0].values, vec![Some(15000.0), Some(13500.0), Some(1500.0)]);
    }

    #[test]
    fn unparsable_and_null_cells_become_missing() {
        let rows: Vec<Vec<JsonValue>> = serde_json::from_str(
            r#"[["NAME","B25064_001E","zip code tabulation area"],
                ["ZCTA5 10001","abc","10001"],
                [null,null,"10002"]]"#,
        )
        .unwrap();
        let table = parse_census_response(CensusDataset::Rent, &rows).unwrap();
        assert_eq!(table.rows[0].values, vec![None]);
        assert_eq!(table.rows[1].name, None);
    }

    #[test]
    fn missing_zcta_column_is_a_shape_error() {
        let rows: Vec<Vec<JsonValue>> =
            serde_json::from_str(r#"[["NAME","B25064_001E"],["x","1"]]"#).unwrap();
        let err = parse_census_response(CensusDataset::Rent, &rows).unwrap_err();
        assert!(matches!(err, AdapterError::Shape(_)));
        assert!(parse_census_response(CensusDataset::Rent, &[]).is_err());
    }

    #[test]
    fn request_selects_name_and_codes_for_every_zcta() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let client = CensusClient::new(fetcher, "2022");
        let request = client.request_for(CensusDataset::Vacancy);
        assert_eq!(request.url, "https://api.census.gov/data/2022/acs/acs5");
        assert_eq!(
            request.query,
            vec![
                ("get".to_string(), "NAME,B25002_001E,B25002_002E,B25002_003E".to_string()),
                ("for".to_string(), "zip code tabulation area:*".to_string()),
            ]
        );
        assert_eq!(request.timeout, Some(CENSUS_TIMEOUT));
    }
}
