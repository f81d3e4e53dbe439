use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nyc_core::{BuildingRecord, BuildingStats, HousingMetric, SyncLogEntry, SyncStatus, SyncType};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};

use crate::aggregate::compute_building_stats;
use crate::error::SyncResult;

/// Upper bound on rows returned by the building lookup.
pub const BUILDING_LOOKUP_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingFilter {
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub limit: Option<i64>,
}

impl BuildingFilter {
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(BUILDING_LOOKUP_LIMIT)
            .clamp(1, BUILDING_LOOKUP_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryStats {
    pub total_zips: i64,
    pub avg_median_rent: f64,
    pub avg_median_income: f64,
    pub avg_vacancy_rate: f64,
    pub total_housing_units: i64,
}

/// Housing metrics and building stats side by side for one ZIP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedMetric {
    pub zip: String,
    pub housing: Option<HousingMetric>,
    pub buildings: Option<BuildingStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub zip_codes: i64,
    pub housing_metrics: i64,
    pub building_info: i64,
    pub building_stats: i64,
    pub sync_logs: i64,
}

/// SQLite-backed store for every persisted table.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and apply migrations.
    pub async fn connect(url: &str) -> SyncResult<Self> {
        let in_memory = url.contains(":memory:");
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        if !in_memory {
            let parent = opts.get_filename().parent();
            if let Some(parent) = parent.filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut pool_opts = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 4 });
        if in_memory {
            // Every connection to `:memory:` is a separate database; keep the one alive.
            pool_opts = pool_opts.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_opts.connect_with(opts).await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> SyncResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> SyncResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn replace_zip_codes(&self, zips: &[String]) -> SyncResult<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM zip_codes").execute(&mut *tx).await?;
        for zip in zips {
            sqlx::query("INSERT INTO zip_codes (zip) VALUES (?)")
                .bind(zip)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(zips.len())
    }

    pub async fn replace_housing_metrics(&self, rows: &[HousingMetric]) -> SyncResult<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM housing_metrics").execute(&mut *tx).await?;
        for m in rows {
            sqlx::query(
                "INSERT INTO housing_metrics (zip, name, median_rent, median_income, \
                 rent_burden, rent_burden_rate, housing_units, total_units, occupied_units, \
                 vacant_units, vacancy_rate) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&m.zip)
            .bind(&m.name)
            .bind(m.median_rent)
            .bind(m.median_income)
            .bind(m.rent_burden)
            .bind(m.rent_burden_rate)
            .bind(m.housing_units)
            .bind(m.total_units)
            .bind(m.occupied_units)
            .bind(m.vacant_units)
            .bind(m.vacancy_rate)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    /// Replace every building and rebuild the stats table in the same transaction.
    pub async fn replace_buildings(&self, rows: &[BuildingRecord]) -> SyncResult<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM building_info").execute(&mut *tx).await?;
        for b in rows {
            sqlx::query(
                "INSERT INTO building_info \
                 (bbl, landuse, yearbuilt, numfloors, unitsres, address, zipcode, borough) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&b.bbl)
            .bind(&b.landuse)
            .bind(b.yearbuilt)
            .bind(b.numfloors)
            .bind(b.unitsres)
            .bind(&b.address)
            .bind(&b.zipcode)
            .bind(&b.borough)
            .execute(&mut *tx)
            .await?;
        }
        let zips = rebuild_building_stats(&mut *tx).await?;
        tx.commit().await?;
        tracing::info!(buildings = rows.len(), zips, "replaced buildings and stats");
        Ok(rows.len())
    }

    pub async fn append_sync_log(
        &self,
        sync_type: SyncType,
        status: SyncStatus,
        records_processed: usize,
        error_message: Option<&str>,
    ) -> SyncResult<SyncLogEntry> {
        let sync_time = Utc::now();
        let records_processed = i64::try_from(records_processed).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "INSERT INTO sync_logs \
             (sync_type, status, records_processed, error_message, sync_time) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(sync_type.as_str())
        .bind(status.as_str())
        .bind(records_processed)
        .bind(error_message)
        .bind(sync_time)
        .execute(&self.pool)
        .await?;

        Ok(SyncLogEntry {
            id: result.last_insert_rowid(),
            sync_type,
            status,
            records_processed,
            error_message: error_message.map(str::to_string),
            sync_time,
        })
    }

    pub async fn zip_codes(&self) -> SyncResult<Vec<String>> {
        let rows = sqlx::query("SELECT zip FROM zip_codes ORDER BY zip")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| row.try_get::<String, _>("zip"))
            .collect::<Result<_, _>>()?)
    }

    pub async fn housing_metrics(&self) -> SyncResult<Vec<HousingMetric>> {
        let rows = sqlx::query(&format!("{METRIC_SELECT} ORDER BY zip"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(metric_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn housing_metric(&self, zip: &str) -> SyncResult<Option<HousingMetric>> {
        let row = sqlx::query(&format!("{METRIC_SELECT} WHERE zip = ?"))
            .bind(zip)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(metric_from_row).transpose()?)
    }

    pub async fn building_stats(&self) -> SyncResult<Vec<BuildingStats>> {
        let rows = sqlx::query(&format!("{STATS_SELECT} ORDER BY zip"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(stats_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn building_stats_for(&self, zip: &str) -> SyncResult<Option<BuildingStats>> {
        let row = sqlx::query(&format!("{STATS_SELECT} WHERE zip = ?"))
            .bind(zip)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(stats_from_row).transpose()?)
    }

    pub async fn buildings_by_zip(
        &self,
        zip: &str,
        filter: &BuildingFilter,
    ) -> SyncResult<Vec<BuildingRecord>> {
        let rows = sqlx::query(
            "SELECT bbl, landuse, yearbuilt, numfloors, unitsres, address, zipcode, borough \
             FROM building_info \
             WHERE zipcode = ?1 \
               AND (?2 IS NULL OR yearbuilt >= ?2) \
               AND (?3 IS NULL OR yearbuilt <= ?3) \
             ORDER BY bbl LIMIT ?4",
        )
        .bind(zip)
        .bind(filter.year_min)
        .bind(filter.year_max)
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(building_from_row).collect::<Result<_, _>>()?)
    }

    /// `None` when no housing metrics are stored yet.
    pub async fn summary(&self) -> SyncResult<Option<SummaryStats>> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total_zips, AVG(median_rent) AS avg_rent, \
             AVG(median_income) AS avg_income, AVG(vacancy_rate) AS avg_vacancy, \
             SUM(housing_units) AS housing_units FROM housing_metrics",
        )
        .fetch_one(&self.pool)
        .await?;

        let total_zips: i64 = row.try_get("total_zips")?;
        if total_zips == 0 {
            return Ok(None);
        }
        Ok(Some(SummaryStats {
            total_zips,
            avg_median_rent: row.try_get::<Option<f64>, _>("avg_rent")?.unwrap_or(0.0),
            avg_median_income: row.try_get::<Option<f64>, _>("avg_income")?.unwrap_or(0.0),
            avg_vacancy_rate: row.try_get::<Option<f64>, _>("avg_vacancy")?.unwrap_or(0.0),
            total_housing_units: row.try_get::<Option<i64>, _>("housing_units")?.unwrap_or(0),
        }))
    }

    /// Outer join of housing metrics and building stats on ZIP.
    pub async fn combined(&self) -> SyncResult<Vec<CombinedMetric>> {
        let mut joined: BTreeMap<String, CombinedMetric> = BTreeMap::new();
        for metric in self.housing_metrics().await? {
            joined.insert(
                metric.zip.clone(),
                CombinedMetric {
                    zip: metric.zip.clone(),
                    housing: Some(metric),
                    buildings: None,
                },
            );
        }
        for stats in self.building_stats().await? {
            let zip = stats.zip.clone();
            let entry = joined.entry(zip.clone()).or_insert_with(|| CombinedMetric {
                zip,
                housing: None,
                buildings: None,
            });
            entry.buildings = Some(stats);
        }
        Ok(joined.into_values().collect())
    }

    pub async fn latest_sync_log(&self) -> SyncResult<Option<SyncLogEntry>> {
        Ok(self.recent_sync_logs(1).await?.into_iter().next())
    }

    /// Most recent entries first.
    pub async fn recent_sync_logs(&self, limit: i64) -> SyncResult<Vec<SyncLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, sync_type, status, records_processed, error_message, sync_time \
             FROM sync_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(sync_log_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn table_counts(&self) -> SyncResult<TableCounts> {
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM zip_codes) AS zip_codes, \
             (SELECT COUNT(*) FROM housing_metrics) AS housing_metrics, \
             (SELECT COUNT(*) FROM building_info) AS building_info, \
             (SELECT COUNT(*) FROM building_stats) AS building_stats, \
             (SELECT COUNT(*) FROM sync_logs) AS sync_logs",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(TableCounts {
            zip_codes: row.try_get("zip_codes")?,
            housing_metrics: row.try_get("housing_metrics")?,
            building_info: row.try_get("building_info")?,
            building_stats: row.try_get("building_stats")?,
            sync_logs: row.try_get("sync_logs")?,
        })
    }
}

const METRIC_SELECT: &str = "SELECT zip, name, median_rent, median_income, rent_burden, \
     rent_burden_rate, housing_units, total_units, occupied_units, vacant_units, vacancy_rate \
     FROM housing_metrics";

const STATS_SELECT: &str = "SELECT zip, total_buildings, avg_floors, avg_year_built, \
     total_residential_units, buildings_pre_1950, buildings_1950_2000, buildings_post_2000 \
     FROM building_stats";

async fn rebuild_building_stats(conn: &mut SqliteConnection) -> Result<usize, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT bbl, landuse, yearbuilt, numfloors, unitsres, address, zipcode, borough \
         FROM building_info WHERE zipcode IS NOT NULL",
    )
    .fetch_all(&mut *conn)
    .await?;
    let buildings = rows
        .iter()
        .map(building_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    let stats = compute_building_stats(&buildings);

    sqlx::query("DELETE FROM building_stats").execute(&mut *conn).await?;
    for s in &stats {
        sqlx::query(
            "INSERT INTO building_stats (zip, total_buildings, avg_floors, avg_year_built, \
             total_residential_units, buildings_pre_1950, buildings_1950_2000, \
             buildings_post_2000) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&s.zip)
        .bind(s.total_buildings)
        .bind(s.avg_floors)
        .bind(s.avg_year_built)
        .bind(s.total_residential_units)
        .bind(s.buildings_pre_1950)
        .bind(s.buildings_1950_2000)
        .bind(s.buildings_post_2000)
        .execute(&mut *conn)
        .await?;
    }
    Ok(stats.len())
}

fn metric_from_row(row: &SqliteRow) -> Result<HousingMetric, sqlx::Error> {
    Ok(HousingMetric {
        zip: row.try_get("zip")?,
        name: row.try_get("name")?,
        median_rent: row.try_get("median_rent")?,
        median_income: row.try_get("median_income")?,
        rent_burden: row.try_get("rent_burden")?,
        rent_burden_rate: row.try_get("rent_burden_rate")?,
        housing_units: row.try_get("housing_units")?,
        total_units: row.try_get("total_units")?,
        occupied_units: row.try_get("occupied_units")?,
        vacant_units: row.try_get("vacant_units")?,
        vacancy_rate: row.try_get("vacancy_rate")?,
    })
}

fn stats_from_row(row: &SqliteRow) -> Result<BuildingStats, sqlx::Error> {
    Ok(BuildingStats {
        zip: row.try_get("zip")?,
        total_buildings: row.try_get("total_buildings")?,
        avg_floors: row.try_get("avg_floors")?,
        avg_year_built: row.try_get("avg_year_built")?,
        total_residential_units: row.try_get("total_residential_units")?,
        buildings_pre_1950: row.try_get("buildings_pre_1950")?,
        buildings_1950_2000: row.try_get("buildings_1950_2000")?,
        buildings_post_2000: row.try_get("buildings_post_2000")?,
    })
}

fn building_from_row(row: &SqliteRow) -> Result<BuildingRecord, sqlx::Error> {
    Ok(BuildingRecord {
        bbl: row.try_get("bbl")?,
        landuse: row.try_get("landuse")?,
        yearbuilt: row.try_get("yearbuilt")?,
        numfloors: row.try_get("numfloors")?,
        unitsres: row.try_get("unitsres")?,
        address: row.try_get("address")?,
        zipcode: row.try_get("zipcode")?,
        borough: row.try_get("borough")?,
    })
}

fn sync_log_from_row(row: &SqliteRow) -> Result<SyncLogEntry, sqlx::Error> {
    let sync_type: String = row.try_get("sync_type")?;
    let status: String = row.try_get("status")?;
    let sync_time: DateTime<Utc> = row.try_get("sync_time")?;
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        sync_type: SyncType::from_str(&sync_type).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        status: SyncStatus::from_str(&status).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        records_processed: row.try_get("records_processed")?,
        error_message: row.try_get("error_message")?,
        sync_time,
    })
}
