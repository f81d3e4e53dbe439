//! Persisted auto-sync policy and the background loop that applies it.
//!
//! The manager owns its config file: it is read once at construction and
//! rewritten after every mutation. The loop is a `tokio-cron-scheduler` job
//! ticking at a short polling interval; each tick runs the same due-check as a
//! manual "check and sync now".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use nyc_core::{AutoSyncConfig, AutoSyncConfigUpdate};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::service::SyncTarget;

/// Result of one scheduled run. A `None` count means the domain was skipped or failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub census: Option<usize>,
    pub pluto: Option<usize>,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn push_error(&mut self, message: String) {
        self.error = Some(match self.error.take() {
            Some(existing) => format!("{existing}; {message}"),
            None => message,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoSyncStatus {
    pub enabled: bool,
    pub interval_hours: u32,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_census: bool,
    pub sync_pluto: bool,
    pub next_sync: Option<DateTime<Utc>>,
    pub time_until_sync: Option<String>,
    pub running: bool,
}

/// `"{h}h {m}m"` until `next`, or `"Overdue"` once it has passed.
pub fn format_time_until(next: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = (next - now).num_seconds();
    if remaining <= 0 {
        return "Overdue".to_string();
    }
    format!("{}h {}m", remaining / 3600, (remaining % 3600) / 60)
}

/// Read the persisted config; a missing or unreadable file yields the defaults.
pub async fn load_config(path: &Path) -> AutoSyncConfig {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return AutoSyncConfig::default(),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "reading auto-sync config failed; using defaults"
            );
            return AutoSyncConfig::default();
        }
    };
    serde_json::from_slice(&bytes).unwrap_or_else(|err| {
        warn!(
            path = %path.display(),
            error = %err,
            "auto-sync config is malformed; using defaults"
        );
        AutoSyncConfig::default()
    })
}

pub async fn save_config(path: &Path, config: &AutoSyncConfig) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(config).context("serializing auto-sync config")?;
    nyc_storage::write_atomic(path, &bytes).await?;
    Ok(())
}

/// State shared between the manager and its background job.
struct Shared {
    target: Arc<dyn SyncTarget>,
    config_path: PathBuf,
    config: Mutex<AutoSyncConfig>,
    run_lock: Mutex<()>,
}

impl Shared {
    /// Holds `run_lock` across the due check and the run.
    async fn check_and_sync(&self) -> Option<SyncOutcome> {
        let _run = self.run_lock.lock().await;
        if !self.config.lock().await.is_due_at(Utc::now()) {
            return None;
        }
        Some(self.run_domains().await)
    }

    /// Background tick: skip outright while another run holds the lock.
    async fn tick(&self) -> Option<SyncOutcome> {
        let Ok(_run) = self.run_lock.try_lock() else {
            debug!("previous auto-sync still running; skipping tick");
            return None;
        };
        if !self.config.lock().await.is_due_at(Utc::now()) {
            return None;
        }
        Some(self.run_domains().await)
    }

    async fn perform_sync(&self) -> SyncOutcome {
        let _run = self.run_lock.lock().await;
        self.run_domains().await
    }

    /// Caller holds `run_lock`.
    async fn run_domains(&self) -> SyncOutcome {
        let (sync_census, sync_pluto) = {
            let config = self.config.lock().await;
            (config.sync_census, config.sync_pluto)
        };

        let mut outcome = SyncOutcome::default();
        if sync_census {
            match self.target.sync_census().await {
                Ok(records) => outcome.census = Some(records),
                Err(err) => outcome.push_error(format!("Census sync failed: {err}")),
            }
        }
        if sync_pluto {
            match self.target.sync_buildings().await {
                Ok(records) => outcome.pluto = Some(records),
                Err(err) => outcome.push_error(format!("PLUTO sync failed: {err}")),
            }
        }

        // Set even when every domain failed.
        let mut config = self.config.lock().await;
        config.last_sync = Some(Utc::now());
        if let Err(err) = save_config(&self.config_path, &config).await {
            warn!(error = %err, "persisting auto-sync config failed");
            outcome.push_error(format!("Saving auto-sync config failed: {err}"));
        }

        info!(
            census = ?outcome.census,
            pluto = ?outcome.pluto,
            error = outcome.error.as_deref().unwrap_or(""),
            "auto-sync run finished"
        );
        outcome
    }
}

/// Owns the persisted auto-sync config and the background polling job.
pub struct AutoSyncManager {
    shared: Arc<Shared>,
    poll_interval: Duration,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl AutoSyncManager {
    pub async fn load(
        target: Arc<dyn SyncTarget>,
        config_path: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        let config_path = config_path.into();
        let config = load_config(&config_path).await;
        Self {
            shared: Arc::new(Shared {
                target,
                config_path,
                config: Mutex::new(config),
                run_lock: Mutex::new(()),
            }),
            poll_interval,
            scheduler: Mutex::new(None),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.shared.config_path
    }

    pub async fn config(&self) -> AutoSyncConfig {
        self.shared.config.lock().await.clone()
    }

    /// Apply and persist `update` without touching the polling loop.
    pub async fn save_update(&self, update: &AutoSyncConfigUpdate) -> SyncResult<AutoSyncConfig> {
        let mut config = self.shared.config.lock().await;
        update.apply(&mut config);
        save_config(&self.shared.config_path, &config).await?;
        Ok(config.clone())
    }

    /// Apply and persist `update`. Turning `enabled` on starts the loop; turning it off stops it.
    pub async fn update(&self, update: AutoSyncConfigUpdate) -> SyncResult<AutoSyncConfig> {
        let config = self.save_update(&update).await?;
        match update.enabled {
            Some(true) => {
                self.start().await?;
            }
            Some(false) => self.stop().await?,
            None => {}
        }
        Ok(config)
    }

    pub async fn should_sync_at(&self, now: DateTime<Utc>) -> bool {
        self.shared.config.lock().await.is_due_at(now)
    }

    pub async fn should_sync(&self) -> bool {
        self.should_sync_at(Utc::now()).await
    }

    /// Run every enabled domain now, isolating failures per domain.
    pub async fn perform_sync(&self) -> SyncOutcome {
        self.shared.perform_sync().await
    }

    /// Sync only if due; `None` when nothing ran.
    pub async fn check_and_sync(&self) -> Option<SyncOutcome> {
        self.shared.check_and_sync().await
    }

    /// Start the polling job. Returns `false` if it is already running.
    pub async fn start(&self) -> SyncResult<bool> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return Ok(false);
        }

        let scheduler = JobScheduler::new().await?;
        let shared = Arc::clone(&self.shared);
        let job = Job::new_repeated_async(self.poll_interval, move |_uuid, _lock| {
            let shared = Arc::clone(&shared);
            Box::pin(async move {
                match shared.tick().await {
                    Some(outcome) if outcome.error.is_some() => {
                        let error = outcome.error.as_deref().unwrap_or("");
                        warn!(error, "scheduled sync had failures")
                    }
                    Some(_) => info!("scheduled sync completed"),
                    None => debug!("auto-sync not due"),
                }
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;
        info!(poll_secs = self.poll_interval.as_secs(), "auto-sync loop started");

        *slot = Some(scheduler);
        Ok(true)
    }

    pub async fn stop(&self) -> SyncResult<()> {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await?;
            info!("auto-sync loop stopped");
        }
        Ok(())
    }

    /// Start the loop when the loaded config already has auto-sync enabled.
    pub async fn start_if_enabled(&self) -> SyncResult<bool> {
        if self.shared.config.lock().await.enabled {
            self.start().await
        } else {
            Ok(false)
        }
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> AutoSyncStatus {
        let config = self.config().await;
        let next_sync = config.next_sync();
        AutoSyncStatus {
            enabled: config.enabled,
            interval_hours: config.interval_hours,
            last_sync: config.last_sync,
            sync_census: config.sync_census,
            sync_pluto: config.sync_pluto,
            next_sync,
            time_until_sync: next_sync.map(|next| format_time_until(next, now)),
            running: self.is_running().await,
        }
    }

    pub async fn status(&self) -> AutoSyncStatus {
        self.status_at(Utc::now()).await
    }
}
