use std::{path::PathBuf, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine};
use metrofleet::{
    artifact::{generate_qr_code, ArtifactCache, ErrorCorrectionLevel, QrFormat, QrOptions},
    cli::AnsiStyles,
    config::FleetConfig,
    health::HealthMonitor,
    lifecycle::LifecycleService,
    models::{SandboxRecord, SandboxStatus},
    remote::{ControlPlane, LogQuery, LogSeverity, RemoteControlClient},
    store::{SandboxStore, SqliteSandboxStore},
    FleetError, FleetResult,
};
use tokio::{fs, signal};
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything a subcommand needs to act on the fleet.
struct Fleet {
    control: Arc<RemoteControlClient>,
    store: Arc<SqliteSandboxStore>,
    service: LifecycleService,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Fleet {
    async fn connect(config: &FleetConfig, monitored: bool) -> FleetResult<Self> {
        let control = Arc::new(RemoteControlClient::new(config.get_control_plane())?);
        let store =
            Arc::new(SqliteSandboxStore::open(config.get_store().get_database_path()).await?);
        let lifecycle = config.get_lifecycle().clone();

        let service = if monitored {
            LifecycleService::with_monitor(
                control.clone(),
                store.clone(),
                HealthMonitor::new(config.get_health()),
                lifecycle,
            )
        } else {
            LifecycleService::new(control.clone(), store.clone(), lifecycle)
        };

        Ok(Self {
            control,
            store,
            service,
        })
    }

    async fn record_for_task(&self, task_id: &str) -> FleetResult<SandboxRecord> {
        self.service
            .get_container_by_task_id(task_id)
            .await?
            .ok_or_else(|| FleetError::SandboxNotFound(format!("no sandbox for task {task_id}")))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub async fn provision_subcommand(
    config: &FleetConfig,
    task_id: &str,
    user_id: &str,
    watch: bool,
) -> FleetResult<()> {
    let fleet = Fleet::connect(config, watch).await?;
    fleet.service.on_event(|event| {
        tracing::info!(container_id = event.container_id(), ?event, "lifecycle event");
        Ok(())
    });

    let sandbox = fleet.service.provision_container(task_id, user_id).await?;

    println!("{} {}", "container:".header(), sandbox.container_id);
    println!("{} {}", "metro url:".header(), sandbox.metro_url.literal());

    let cache = ArtifactCache::from_config(config.get_artifacts());
    let code = cache
        .connection_code(
            task_id,
            &sandbox.metro_url,
            &QrOptions::from_config(config.get_artifacts()),
        )
        .await?;
    println!("{}", code.data);

    if watch {
        println!("watching {}, press ctrl-c to stop", sandbox.container_id.literal());
        signal::ctrl_c().await?;
        fleet.service.shutdown().await;
    }

    Ok(())
}

pub async fn status_subcommand(config: &FleetConfig, task_id: &str) -> FleetResult<()> {
    let fleet = Fleet::connect(config, false).await?;
    let record = fleet.record_for_task(task_id).await?;
    let remote = fleet.control.get_container_status(&record.container_id).await?;

    print_record(&record);
    println!("{} {}", "remote status:".header(), remote.status);
    if let Some(uptime) = remote.uptime_seconds {
        println!("{} {uptime}s", "uptime:".header());
    }
    if let Some(usage) = remote.resource_usage.or(record.resource_usage) {
        println!("{} {}", "resources:".header(), serde_json::to_string(&usage)?);
    }

    Ok(())
}

pub async fn list_subcommand(config: &FleetConfig) -> FleetResult<()> {
    let fleet = Fleet::connect(config, false).await?;
    for record in fleet.store.list().await? {
        println!(
            "{:<24} {:<10} {:<40} {}",
            record.task_id,
            status_label(&record),
            record.container_id,
            record.last_activity_at.to_rfc3339()
        );
    }

    Ok(())
}

pub async fn logs_subcommand(
    config: &FleetConfig,
    task_id: &str,
    limit: u32,
    inspect: bool,
) -> FleetResult<()> {
    let fleet = Fleet::connect(config, false).await?;
    let record = fleet.record_for_task(task_id).await?;

    let page = fleet
        .control
        .get_container_logs(
            &record.container_id,
            &LogQuery {
                limit: Some(limit),
                cursor: None,
            },
        )
        .await?;

    for log in &page.logs {
        let severity = match log.severity {
            LogSeverity::Error => "ERROR".error(),
            LogSeverity::Warn => "WARN".header(),
            LogSeverity::Debug => "DEBUG".to_string(),
            LogSeverity::Info => "INFO".to_string(),
        };
        println!("{} {severity} {}", log.timestamp.to_rfc3339(), log.message);
    }

    if inspect {
        let inspection = fleet.service.inspect_logs(&record.container_id).await?;
        match (inspection.failure, inspection.outcome) {
            (Some(failure), Some(outcome)) => {
                println!("{} {}: {}", "failure:".error(), failure.kind, failure.line);
                println!("{} {:?}: {}", "action:".header(), outcome.action, outcome.message);
            }
            _ => println!("{}", "no failure found".valid()),
        }
    }

    Ok(())
}

pub async fn stop_subcommand(config: &FleetConfig, task_id: &str) -> FleetResult<()> {
    let fleet = Fleet::connect(config, false).await?;
    let record = fleet.record_for_task(task_id).await?;

    fleet.service.stop_container(&record.container_id).await?;
    println!("{} {}", "stopped".valid(), record.container_id);

    Ok(())
}

pub async fn delete_subcommand(config: &FleetConfig, task_id: &str) -> FleetResult<()> {
    let fleet = Fleet::connect(config, false).await?;
    let record = fleet.record_for_task(task_id).await?;

    fleet.service.delete_container(&record.container_id).await?;
    println!("{} {}", "deleted".valid(), record.container_id);

    Ok(())
}

pub async fn sweep_subcommand(config: &FleetConfig, watch: bool) -> FleetResult<()> {
    let fleet = Fleet::connect(config, false).await?;

    if !watch {
        let report = fleet.service.cleanup_inactive_containers().await?;
        println!("{} {}", "stopped:".header(), report.stopped_count);
        for failure in report.errors {
            println!("{} {}: {}", "failed:".error(), failure.container_id, failure.error);
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let sweeper = fleet.service.spawn_cleanup_loop(cancel.clone());
    println!(
        "sweeping every {}s, press ctrl-c to stop",
        config.get_lifecycle().cleanup_interval().as_secs()
    );

    signal::ctrl_c().await?;
    cancel.cancel();
    sweeper.await?;

    Ok(())
}

pub async fn probe_subcommand(config: &FleetConfig, url: &str) -> FleetResult<()> {
    let monitor = HealthMonitor::new(config.get_health());
    let state = monitor.check_health(url).await;

    if state.healthy {
        println!("{} in {}ms", "healthy".valid(), state.response_time_ms);
    } else {
        println!(
            "{} after {}ms: {}",
            "unhealthy".error(),
            state.response_time_ms,
            state.error.as_deref().unwrap_or("no candidate path answered")
        );
    }

    Ok(())
}

pub async fn qr_subcommand(
    config: &FleetConfig,
    url: String,
    format: QrFormat,
    size: Option<u32>,
    level: ErrorCorrectionLevel,
    margin: Option<u32>,
    output: Option<PathBuf>,
) -> FleetResult<()> {
    let defaults = QrOptions::from_config(config.get_artifacts());
    let options = QrOptions {
        size: size.unwrap_or(defaults.size),
        format,
        error_correction_level: level,
        margin: margin.unwrap_or(defaults.margin),
    };

    let artifact = generate_qr_code(&url, &options)?;

    match output {
        Some(path) => {
            let bytes = match artifact.format {
                QrFormat::Svg => artifact.data.into_bytes(),
                QrFormat::Png => STANDARD.decode(&artifact.data).map_err(FleetError::custom)?,
            };
            fs::write(&path, bytes).await?;
            println!("{} {}", "wrote".valid(), path.display());
        }
        None => println!("{}", artifact.data),
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn print_record(record: &SandboxRecord) {
    println!("{} {}", "task:".header(), record.task_id);
    println!("{} {}", "container:".header(), record.container_id);
    println!("{} {}", "metro url:".header(), record.metro_url.literal());
    println!("{} {}", "status:".header(), status_label(record));
    println!("{} {}", "last activity:".header(), record.last_activity_at.to_rfc3339());
    if let Some(message) = &record.error_message {
        println!("{} {message}", "error:".error());
    }
}

fn status_label(record: &SandboxRecord) -> String {
    let status = record.status.to_string();
    match record.status {
        SandboxStatus::Running => status.valid(),
        SandboxStatus::Error => status.error(),
        _ => status,
    }
}
