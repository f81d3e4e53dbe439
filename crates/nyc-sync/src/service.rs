use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use nyc_adapters::{write_cache_snapshot, HousingSource, PlutoQuery, SourceKind};
use nyc_core::{SyncDomain, SyncStatus, SyncType};
use nyc_storage::{CacheDir, WrittenFile};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::db::Store;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::reconcile;

/// What the scheduler (and anything else) needs to trigger a sync.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    /// Full census sync: ZIP list, census tables, reconciled metrics.
    async fn sync_census(&self) -> SyncResult<usize>;

    async fn sync_buildings(&self) -> SyncResult<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncAllSummary {
    pub census: usize,
    pub buildings: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InitSummary {
    pub from_cache: bool,
    pub census: usize,
    pub buildings: Option<usize>,
}

/// Runs census and building syncs against the store, one at a time per domain.
pub struct SyncService {
    store: Store,
    live: Arc<dyn HousingSource>,
    cached: Arc<dyn HousingSource>,
    cache: CacheDir,
    building_query: PlutoQuery,
    census_lock: Mutex<()>,
    buildings_lock: Mutex<()>,
}

impl SyncService {
    pub fn new(
        store: Store,
        live: Arc<dyn HousingSource>,
        cached: Arc<dyn HousingSource>,
        cache: CacheDir,
    ) -> Self {
        Self {
            store,
            live,
            cached,
            cache,
            building_query: PlutoQuery::default(),
            census_lock: Mutex::new(()),
            buildings_lock: Mutex::new(()),
        }
    }

    pub fn with_building_query(mut self, query: PlutoQuery) -> Self {
        self.building_query = query;
        self
    }

    pub fn from_config(config: &SyncConfig, store: Store) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self::new(
            store,
            Arc::new(config.live_source()?),
            Arc::new(config.cached_source()),
            config.cache_dir(),
        )
        .with_building_query(config.pluto.clone()))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn building_query(&self) -> &PlutoQuery {
        &self.building_query
    }

    pub async fn sync_census(&self) -> SyncResult<usize> {
        self.run_census(self.live.as_ref()).await
    }

    pub async fn load_census_from_cache(&self) -> SyncResult<usize> {
        self.run_census(self.cached.as_ref()).await
    }

    pub async fn sync_buildings(&self) -> SyncResult<usize> {
        self.run_buildings(self.live.as_ref(), &self.building_query).await
    }

    pub async fn sync_buildings_with(&self, query: &PlutoQuery) -> SyncResult<usize> {
        self.run_buildings(self.live.as_ref(), query).await
    }

    pub async fn load_buildings_from_cache(&self) -> SyncResult<usize> {
        self.run_buildings(self.cached.as_ref(), &self.building_query).await
    }

    /// Census then buildings; the first failure ends the run.
    pub async fn sync_all(&self) -> SyncResult<SyncAllSummary> {
        let census = self.sync_census().await?;
        let buildings = self.sync_buildings().await?;
        Ok(SyncAllSummary { census, buildings })
    }

    /// Pull every dataset from the live APIs and rewrite the cached flat files.
    ///
    /// `buildings` of `None` skips the PLUTO pull and leaves any cached building file as is.
    pub async fn refresh_cache(
        &self,
        buildings: Option<&PlutoQuery>,
    ) -> SyncResult<Vec<WrittenFile>> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id, sync_type = "cache_refresh");
        async {
            let zips = self.live.zip_list().await?;
            let tables = self.live.census_tables().await?;
            let records = match buildings {
                Some(query) => Some(self.live.buildings(query).await?),
                None => None,
            };
            let written =
                write_cache_snapshot(&self.cache, &zips, &tables, records.as_deref()).await?;
            info!(files = written.len(), root = %self.cache.root().display(), "refreshed cache");
            Ok::<_, SyncError>(written)
        }
        .instrument(span)
        .await
    }

    /// Migrate, then seed from the cache when it is complete, else from the live census API.
    pub async fn init(&self) -> SyncResult<InitSummary> {
        self.store.migrate().await?;

        if self.cached.preflight(SyncDomain::Census).await.is_err() {
            info!("cached census files missing; syncing from the live API");
            let census = self.sync_census().await?;
            return Ok(InitSummary {
                from_cache: false,
                census,
                buildings: None,
            });
        }

        let census = self.load_census_from_cache().await?;
        let buildings = if self.cached.preflight(SyncDomain::Buildings).await.is_ok() {
            match self.load_buildings_from_cache().await {
                Ok(count) => Some(count),
                Err(err) => {
                    warn!(
                        error = %err,
                        "cached building load failed; continuing without buildings"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(InitSummary {
            from_cache: true,
            census,
            buildings,
        })
    }

    async fn run_census(&self, source: &dyn HousingSource) -> SyncResult<usize> {
        let _guard = self
            .census_lock
            .try_lock()
            .map_err(|_| SyncError::InProgress(SyncDomain::Census))?;

        let sync_type = match source.kind() {
            SourceKind::Live => SyncType::FullSync,
            SourceKind::Cached => SyncType::CsvLoad,
        };
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id, sync_type = sync_type.as_str());
        async {
            let result = self.census_steps(source).await;
            self.finish(sync_type, result).await
        }
        .instrument(span)
        .await
    }

    async fn census_steps(&self, source: &dyn HousingSource) -> SyncResult<usize> {
        source.preflight(SyncDomain::Census).await?;

        let zips = async {
            let zips = source.zip_list().await?;
            self.store.replace_zip_codes(&zips).await?;
            Ok::<_, SyncError>(zips)
        }
        .await;
        if source.kind() == SourceKind::Live {
            self.log_outcome(SyncType::ZipList, zips.as_ref().map(Vec::len)).await?;
        }
        let nyc_zips: HashSet<String> = zips?.into_iter().collect();

        let tables = source.census_tables().await?;
        let metrics = reconcile(&tables, &nyc_zips);
        info!(
            tables = tables.len(),
            zips = nyc_zips.len(),
            rows = metrics.len(),
            "reconciled census tables"
        );
        self.store.replace_housing_metrics(&metrics).await
    }

    async fn run_buildings(
        &self,
        source: &dyn HousingSource,
        query: &PlutoQuery,
    ) -> SyncResult<usize> {
        let _guard = self
            .buildings_lock
            .try_lock()
            .map_err(|_| SyncError::InProgress(SyncDomain::Buildings))?;

        let sync_type = match source.kind() {
            SourceKind::Live => SyncType::PlutoSync,
            SourceKind::Cached => SyncType::PlutoCsvLoad,
        };
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id, sync_type = sync_type.as_str());
        async {
            let result = async {
                source.preflight(SyncDomain::Buildings).await?;
                let records = source.buildings(query).await?;
                self.store.replace_buildings(&records).await
            }
            .await;
            self.finish(sync_type, result).await
        }
        .instrument(span)
        .await
    }

    async fn finish(&self, sync_type: SyncType, result: SyncResult<usize>) -> SyncResult<usize> {
        self.log_outcome(sync_type, result.as_ref().copied()).await?;
        result
    }

    /// Append the audit row for one step. A failure to record a failed step is only logged
    /// so the original error reaches the caller.
    async fn log_outcome(
        &self,
        sync_type: SyncType,
        outcome: Result<usize, &SyncError>,
    ) -> SyncResult<()> {
        match outcome {
            Ok(records) => {
                self.store
                    .append_sync_log(sync_type, SyncStatus::Success, records, None)
                    .await?;
                info!(sync_type = sync_type.as_str(), records, "sync step succeeded");
            }
            Err(err) => {
                let message = err.to_string();
                error!(sync_type = sync_type.as_str(), error = %message, "sync step failed");
                if let Err(log_err) = self
                    .store
                    .append_sync_log(sync_type, SyncStatus::Failed, 0, Some(&message))
                    .await
                {
                    warn!(error = %log_err, "could not record failed sync");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncTarget for SyncService {
    async fn sync_census(&self) -> SyncResult<usize> {
        SyncService::sync_census(self).await
    }

    async fn sync_buildings(&self) -> SyncResult<usize> {
        SyncService::sync_buildings(self).await
    }
}
