use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use nyc_core::{BuildingRecord, RESIDENTIAL_LAND_USE};
use nyc_storage::{FetchRequest, HttpFetcher};
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use crate::{json_cell, AdapterError, RawBuilding};

pub const ZIP_LIST_URL: &str = "https://data.cityofnewyork.us/resource/pri4-ifjk.json";
pub const PLUTO_URL: &str = "https://data.cityofnewyork.us/resource/64uk-42ks.json";

pub const PLUTO_FIELDS: [&str; 8] = [
    "bbl",
    "landuse",
    "yearbuilt",
    "numfloors",
    "unitsres",
    "address",
    "zipcode",
    "borough",
];

const ZIP_LIST_TIMEOUT: Duration = Duration::from_secs(30);
const PLUTO_TIMEOUT: Duration = Duration::from_secs(60);

/// Filters and paging for the PLUTO residential pull.
#[derive(Debug, Clone, PartialEq)]
pub struct PlutoQuery {
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub borough: Option<String>,
    pub limit: usize,
    pub page_size: usize,
    pub page_delay: Duration,
}

impl Default for PlutoQuery {
    fn default() -> Self {
        Self {
            year_min: Some(1900),
            year_max: Some(2025),
            borough: None,
            limit: 100_000,
            page_size: 5_000,
            page_delay: Duration::from_millis(150),
        }
    }
}

impl PlutoQuery {
    pub fn where_clause(&self) -> String {
        let codes = RESIDENTIAL_LAND_USE
            .iter()
            .map(|code| format!("'{code}'"))
            .collect::<Vec<_>>()
            .join(",");
        let mut clauses = vec![format!("landuse in({codes})")];
        if let Some(min) = self.year_min {
            clauses.push(format!("yearbuilt >= {min}"));
        }
        if let Some(max) = self.year_max {
            clauses.push(format!("yearbuilt <= {max}"));
        }
        if let Some(borough) = self.borough.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            let escaped = borough.to_uppercase().replace('\'', "''");
            clauses.push(format!("upper(borough) = '{escaped}'"));
        }
        clauses.join(" AND ")
    }

    pub fn total_pages(&self) -> usize {
        self.limit.div_ceil(self.page_size.max(1))
    }
}

/// Socrata client for the MODZCTA ZIP list and the PLUTO dataset.
#[derive(Debug, Clone)]
pub struct SocrataClient {
    fetcher: HttpFetcher,
    app_token: Option<String>,
    zip_list_url: String,
    pluto_url: String,
}

impl SocrataClient {
    pub fn new(fetcher: HttpFetcher, app_token: Option<String>) -> Self {
        Self {
            fetcher,
            app_token: app_token.filter(|t| !t.trim().is_empty()),
            zip_list_url: ZIP_LIST_URL.to_string(),
            pluto_url: PLUTO_URL.to_string(),
        }
    }

    pub fn with_urls(
        mut self,
        zip_list_url: impl Into<String>,
        pluto_url: impl Into<String>,
    ) -> Self {
        self.zip_list_url = zip_list_url.into();
        self.pluto_url = pluto_url.into();
        self
    }

    fn with_token(&self, request: FetchRequest) -> FetchRequest {
        match &self.app_token {
            Some(token) => request.header("X-App-Token", token.clone()),
            None => request,
        }
    }

    pub async fn fetch_zip_list(&self) -> Result<Vec<String>, AdapterError> {
        let request = self.with_token(
            FetchRequest::get(&self.zip_list_url)
                .query("$select", "modzcta")
                .query("$limit", "300")
                .timeout(ZIP_LIST_TIMEOUT),
        );
        let rows: Vec<Map<String, JsonValue>> = self.fetcher.fetch_json(&request).await?;
        let zips = parse_zip_list(&rows);
        info!(zips = zips.len(), "fetched NYC ZIP list");
        Ok(zips)
    }

    fn page_request(&self, query: &PlutoQuery, offset: usize, limit: usize) -> FetchRequest {
        self.with_token(
            FetchRequest::get(&self.pluto_url)
                .query("$select", PLUTO_FIELDS.join(","))
                .query("$where", query.where_clause())
                .query("$order", "yearbuilt DESC")
                .query("$limit", limit.to_string())
                .query("$offset", offset.to_string())
                .timeout(PLUTO_TIMEOUT),
        )
    }

    pub async fn fetch_buildings(
        &self,
        query: &PlutoQuery,
    ) -> Result<Vec<BuildingRecord>, AdapterError> {
        let total_pages = query.total_pages();
        let rows = paginate(
            query.limit,
            query.page_size,
            query.page_delay,
            |page_no, offset, limit| {
                let request = self.page_request(query, offset, limit);
                async move {
                    let page: Vec<Map<String, JsonValue>> =
                        self.fetcher.fetch_json(&request).await?;
                    info!(
                        page = page_no + 1,
                        total_pages,
                        records = page.len(),
                        "fetched PLUTO page"
                    );
                    Ok::<_, AdapterError>(page)
                }
            },
        )
        .await?;
        Ok(parse_building_page(&rows))
    }
}

/// Pull pages of at most `page_size` until an empty page, a short page, or `limit` records.
///
/// `fetch_page` receives `(page_index, offset, page_limit)`; `delay` separates consecutive pages.
pub async fn paginate<T, E, F, Fut>(
    limit: usize,
    page_size: usize,
    delay: Duration,
    mut fetch_page: F,
) -> Result<Vec<T>, E>
where
    F: FnMut(usize, usize, usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
{
    let page_size = page_size.max(1);
    let mut out = Vec::new();
    let mut page_no = 0usize;

    while out.len() < limit {
        let page_limit = page_size.min(limit - out.len());
        let page = fetch_page(page_no, out.len(), page_limit).await?;
        let received = page.len();
        out.extend(page);
        page_no += 1;

        if received < page_limit || out.len() >= limit {
            break;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    Ok(out)
}

/// MODZCTA rows to a sorted, de-duplicated list of padded ZIPs.
pub fn parse_zip_list(rows: &[Map<String, JsonValue>]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get("modzcta").and_then(json_cell))
        .filter_map(|raw| nyc_core::normalize_zip(&raw))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn parse_building_page(rows: &[Map<String, JsonValue>]) -> Vec<BuildingRecord> {
    let field = |row: &Map<String, JsonValue>, name: &str| row.get(name).and_then(json_cell);
    let mut dropped = 0usize;
    let records = rows
        .iter()
        .filter_map(|row| {
            let record = RawBuilding {
                bbl: field(row, "bbl"),
                landuse: field(row, "landuse"),
                yearbuilt: field(row, "yearbuilt"),
                numfloors: field(row, "numfloors"),
                unitsres: field(row, "unitsres"),
                address: field(row, "address"),
                zipcode: field(row, "zipcode"),
                borough: field(row, "borough"),
            }
            .into_record();
            if record.is_none() {
                dropped += 1;
            }
            record
        })
        .collect();
    if dropped > 0 {
        warn!(dropped, "skipped PLUTO rows without a BBL");
    }
    records
}
