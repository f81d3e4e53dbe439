use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nyc_adapters::PlutoQuery;
use nyc_core::AutoSyncConfigUpdate;
use nyc_sync::{AutoSyncManager, Store, SyncConfig, SyncService, SyncTarget};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "nyc-cli")]
#[command(about = "NYC housing data sync and API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the schema and seed it from the cache, or from the live census API.
    Init,
    /// Sync from the live APIs.
    Sync {
        #[command(subcommand)]
        target: SyncCommand,
    },
    /// Load the store from the cached flat files.
    LoadCache {
        #[command(subcommand)]
        target: CacheTarget,
    },
    /// Refresh the cached flat files from the live APIs.
    Fetch {
        #[command(flatten)]
        buildings: BuildingArgs,
        #[arg(long)]
        skip_pluto: bool,
    },
    /// Serve the JSON API; starts the auto-sync loop if it is enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    AutoSync {
        #[command(subcommand)]
        action: AutoSyncCommand,
    },
    /// Show recent sync log entries.
    Log {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    Census,
    Buildings(BuildingArgs),
    All,
}

#[derive(Debug, Subcommand)]
enum CacheTarget {
    Census,
    Buildings,
}

#[derive(Debug, Subcommand)]
enum AutoSyncCommand {
    Status,
    Enable,
    Disable,
    Set {
        #[arg(long)]
        interval_hours: Option<u32>,
        #[arg(long)]
        census: Option<bool>,
        #[arg(long)]
        pluto: Option<bool>,
    },
    /// Sync now if due.
    Check,
    /// Sync every enabled domain now, ignoring the interval.
    Run,
    /// Run the polling loop in the foreground until Ctrl-C.
    Watch,
}

#[derive(Debug, Clone, Default, Args)]
struct BuildingArgs {
    #[arg(long)]
    year_min: Option<i32>,
    #[arg(long)]
    year_max: Option<i32>,
    #[arg(long)]
    borough: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

impl BuildingArgs {
    fn apply(&self, base: &PlutoQuery) -> PlutoQuery {
        let mut query = base.clone();
        if self.year_min.is_some() {
            query.year_min = self.year_min;
        }
        if self.year_max.is_some() {
            query.year_max = self.year_max;
        }
        if self.borough.is_some() {
            query.borough = self.borough.clone();
        }
        if let Some(limit) = self.limit {
            query.limit = limit;
        }
        query
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    let service = Arc::new(SyncService::from_config(&config, store)?);

    match cli.command {
        Commands::Init => {
            let summary = service.init().await?;
            let source = if summary.from_cache { "cache" } else { "live API" };
            println!("initialized from {source}: census={} records", summary.census);
            if let Some(buildings) = summary.buildings {
                println!("loaded {buildings} cached buildings");
            }
        }
        Commands::Sync { target } => match target {
            SyncCommand::Census => {
                println!("census sync complete: {} records", service.sync_census().await?);
            }
            SyncCommand::Buildings(args) => {
                let query = args.apply(service.building_query());
                let records = service.sync_buildings_with(&query).await?;
                println!("building sync complete: {records} records");
            }
            SyncCommand::All => {
                let summary = service.sync_all().await?;
                println!(
                    "sync complete: census={} buildings={}",
                    summary.census, summary.buildings
                );
            }
        },
        Commands::LoadCache { target } => match target {
            CacheTarget::Census => {
                let records = service.load_census_from_cache().await?;
                println!("loaded {records} census records from {}", config.data_dir.display());
            }
            CacheTarget::Buildings => {
                let records = service.load_buildings_from_cache().await?;
                println!("loaded {records} buildings from {}", config.data_dir.display());
            }
        },
        Commands::Fetch {
            buildings,
            skip_pluto,
        } => {
            let query = buildings.apply(service.building_query());
            let written = service
                .refresh_cache(if skip_pluto { None } else { Some(&query) })
                .await?;
            for file in &written {
                println!(
                    "{}  {} bytes  {}",
                    file.content_hash,
                    file.byte_size,
                    file.path.display()
                );
            }
        }
        Commands::Serve { port } => {
            let auto_sync = Arc::new(auto_sync_manager(&config, &service).await);
            auto_sync.start_if_enabled().await?;
            let state = nyc_web::AppState::new(service.clone(), auto_sync.clone());
            nyc_web::serve(state, port.unwrap_or(config.web_port)).await?;
            auto_sync.stop().await?;
        }
        Commands::AutoSync { action } => {
            let manager = auto_sync_manager(&config, &service).await;
            match action {
                AutoSyncCommand::Status => {}
                AutoSyncCommand::Enable => {
                    // The loop runs under `serve` or `auto-sync watch`.
                    manager
                        .save_update(&AutoSyncConfigUpdate {
                            enabled: Some(true),
                            ..Default::default()
                        })
                        .await?;
                }
                AutoSyncCommand::Disable => {
                    manager
                        .update(AutoSyncConfigUpdate {
                            enabled: Some(false),
                            ..Default::default()
                        })
                        .await?;
                }
                AutoSyncCommand::Set {
                    interval_hours,
                    census,
                    pluto,
                } => {
                    let update = AutoSyncConfigUpdate {
                        enabled: None,
                        interval_hours,
                        sync_census: census,
                        sync_pluto: pluto,
                    };
                    if update.is_empty() {
                        anyhow::bail!("nothing to set; pass --interval-hours, --census or --pluto");
                    }
                    manager.update(update).await?;
                }
                AutoSyncCommand::Check => match manager.check_and_sync().await {
                    Some(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                    None => println!("auto-sync not due"),
                },
                AutoSyncCommand::Run => {
                    let outcome = manager.perform_sync().await;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
                AutoSyncCommand::Watch => {
                    if !manager.config().await.enabled {
                        anyhow::bail!(
                            "auto-sync is disabled; run `nyc-cli auto-sync enable` first"
                        );
                    }
                    manager.start().await?;
                    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
                    manager.stop().await?;
                }
            }
            println!("{}", serde_json::to_string_pretty(&manager.status().await)?);
        }
        Commands::Log { limit } => {
            for entry in service.store().recent_sync_logs(limit).await? {
                println!(
                    "{}  {:<14} {:<7} {:>7}  {}",
                    entry.sync_time.format("%Y-%m-%d %H:%M:%S"),
                    entry.sync_type.as_str(),
                    entry.status.as_str(),
                    entry.records_processed,
                    entry.error_message.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

async fn auto_sync_manager(config: &SyncConfig, service: &Arc<SyncService>) -> AutoSyncManager {
    let target: Arc<dyn SyncTarget> = service.clone();
    AutoSyncManager::load(target, config.auto_sync_config.clone(), config.auto_sync_poll).await
}
