use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use nyc_adapters::{
    CachedSource, CensusClient, LiveSource, PlutoQuery, SocrataClient, DEFAULT_ACS_YEAR,
};
use nyc_storage::{CacheDir, HttpClientConfig, HttpFetcher};

use crate::error::{SyncError, SyncResult};

pub const AUTO_SYNC_CONFIG_FILE: &str = "auto_sync_config.json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub auto_sync_config: PathBuf,
    pub acs_year: String,
    pub socrata_app_token: Option<String>,
    pub user_agent: String,
    pub pluto: PlutoQuery,
    pub web_port: u16,
    pub auto_sync_poll: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| text(key).and_then(|v| v.parse::<i64>().ok());

        let data_dir = text("NYC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let auto_sync_config = text("NYC_AUTO_SYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(AUTO_SYNC_CONFIG_FILE));

        let defaults = PlutoQuery::default();
        let pluto = PlutoQuery {
            year_min: parsed("NYC_PLUTO_YEAR_MIN")
                .map(|v| v as i32)
                .or(defaults.year_min),
            year_max: parsed("NYC_PLUTO_YEAR_MAX")
                .map(|v| v as i32)
                .or(defaults.year_max),
            borough: text("NYC_PLUTO_BOROUGH"),
            limit: parsed("NYC_PLUTO_LIMIT")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.limit),
            page_size: parsed("NYC_PLUTO_PAGE_SIZE")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.page_size),
            page_delay: parsed("NYC_PLUTO_PAGE_DELAY_MS")
                .and_then(|v| u64::try_from(v).ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.page_delay),
        };

        Self {
            database_url: text("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/nyc_housing.db".to_string()),
            data_dir,
            auto_sync_config,
            acs_year: text("ACS_YEAR").unwrap_or_else(|| DEFAULT_ACS_YEAR.to_string()),
            socrata_app_token: text("SOCRATA_APP_TOKEN"),
            user_agent: text("NYC_USER_AGENT")
                .unwrap_or_else(|| "nyc-housing-sync/0.1".to_string()),
            pluto,
            web_port: parsed("NYC_WEB_PORT")
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(8000),
            auto_sync_poll: parsed("NYC_AUTO_SYNC_POLL_SECS")
                .and_then(|v| u64::try_from(v).ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60)),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.pluto.page_size == 0 {
            return Err(SyncError::Config("NYC_PLUTO_PAGE_SIZE must be positive".to_string()));
        }
        if let (Some(min), Some(max)) = (self.pluto.year_min, self.pluto.year_max) {
            if min > max {
                return Err(SyncError::Config(format!(
                    "year range is empty: {min} > {max}"
                )));
            }
        }
        if self.acs_year.len() != 4 || !self.acs_year.chars().all(|c| c.is_ascii_digit()) {
            return Err(SyncError::Config(format!(
                "ACS_YEAR must be a four-digit year, got `{}`",
                self.acs_year
            )));
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> CacheDir {
        CacheDir::new(self.data_dir.clone())
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })
    }

    pub fn live_source(&self) -> Result<LiveSource> {
        let fetcher = self.http_fetcher()?;
        Ok(LiveSource::new(
            CensusClient::new(fetcher.clone(), &self.acs_year),
            SocrataClient::new(fetcher, self.socrata_app_token.clone()),
        ))
    }

    pub fn cached_source(&self) -> CachedSource {
        CachedSource::new(self.cache_dir())
    }
}
