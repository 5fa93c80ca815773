use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use upsync_contract::{BatchInput, LocalAction, UploadEvent, UploadPolicy};
use upsync_control_plane::{build_router, AppState};
use upsync_storage::{NewUpload, StorageConfig, UpsyncStorage};
use upsync_transfer::{
    CollectionHook, DeviceConditions, EventSink, ExecutorConfig, Gate, OrchestratorConfig,
    PauseSwitch, StaticConditions, UploadOrchestrator,
};
use upsync_transport::{MirrorTransport, StaticAccounts};

#[derive(Debug, Parser)]
#[command(author, version, about = "Background upload orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP control plane.
    Serve {
        #[arg(long, default_value = "config/upsyncd.toml")]
        config: PathBuf,
    },
    /// Queue one file for upload.
    Enqueue {
        #[arg(long, default_value = "config/upsyncd.toml")]
        config: PathBuf,
        #[arg(long)]
        account: String,
        #[arg(long)]
        local: PathBuf,
        #[arg(long)]
        remote: String,
        #[arg(long)]
        wifi_only: bool,
        #[arg(long)]
        charging_only: bool,
        #[arg(long)]
        delete_local: bool,
    },
    /// Run one batch in the foreground and exit.
    Run {
        #[arg(long, default_value = "config/upsyncd.toml")]
        config: PathBuf,
        #[arg(long)]
        account: String,
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<i64>,
        #[arg(long, default_value_t = 0)]
        batch_index: i64,
        #[arg(long)]
        total: Option<i64>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        suppress_same_file: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    http: HttpSection,
    storage: StorageSection,
    transport: TransportSection,
    accounts: AccountsSection,
    #[serde(default)]
    orchestrator: OrchestratorSection,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
    auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    sqlite_path: String,
    retention_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct TransportSection {
    mirror_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
struct AccountsSection {
    names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct OrchestratorSection {
    milestone_every: usize,
    batch_capacity: usize,
    progress_interval_ms: u64,
    delay_in_power_save: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            milestone_every: 100,
            batch_capacity: 500,
            progress_interval_ms: 750,
            delay_in_power_save: true,
        }
    }
}

impl OrchestratorSection {
    fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            milestone_every: self.milestone_every,
            batch_capacity: self.batch_capacity,
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            executor: ExecutorConfig {
                delay_in_power_save: self.delay_in_power_save,
            },
        }
    }
}

/// Prints orchestrator events to the log when no UI is attached.
struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: UploadEvent) {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        info!(event = event.name(), %data, "upload event");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Enqueue {
            config,
            account,
            local,
            remote,
            wifi_only,
            charging_only,
            delete_local,
        } => {
            let policy = UploadPolicy {
                requires_wifi: wifi_only,
                requires_charging: charging_only,
                local_action: if delete_local {
                    LocalAction::DeleteLocal
                } else {
                    LocalAction::KeepLocal
                },
                ..UploadPolicy::default()
            };
            enqueue(
                config,
                NewUpload {
                    account,
                    local_path: local,
                    remote_path: remote,
                    policy,
                },
            )
            .await
        }
        Command::Run {
            config,
            account,
            ids,
            batch_index,
            total,
            label,
            suppress_same_file,
        } => {
            let total = total.unwrap_or(ids.len() as i64);
            let input = BatchInput {
                account: Some(account),
                record_ids: Some(ids),
                batch_index: Some(batch_index),
                total_upload_size: Some(total),
                suppress_same_file_notification: suppress_same_file,
                destination_label: label,
            };
            run_once(config, input).await
        }
    }
}

fn load_config(config_path: &Path) -> Result<RuntimeConfig> {
    let config_source = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    toml::from_str(&config_source)
        .with_context(|| format!("invalid config TOML at {}", config_path.display()))
}

async fn open_storage(config: &RuntimeConfig) -> Result<UpsyncStorage> {
    UpsyncStorage::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
    })
    .await
}

fn accounts(config: &RuntimeConfig) -> StaticAccounts {
    let endpoint = format!("file://{}", config.transport.mirror_root.display());
    StaticAccounts::new(config.accounts.names.iter().cloned(), &endpoint)
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let storage = open_storage(&config).await?;

    if let Some(days) = config.storage.retention_days {
        let purged = storage.purge_finished(days).await?;
        info!(purged, retention_days = days, "finished uploads purged");
    }

    let require_bearer = requires_token(&config.http.bind);
    if require_bearer && config.http.auth_token.is_none() {
        return Err(anyhow!(
            "non-loopback bind {} requires http.auth_token",
            config.http.bind
        ));
    }

    if !require_bearer {
        info!("loopback bind detected: bearer auth optional");
    } else {
        warn!("non-loopback bind detected: bearer auth enforced");
    }

    let transport = Arc::new(MirrorTransport::new(config.transport.mirror_root.clone()));
    let state = AppState::new(
        storage,
        transport,
        Arc::new(accounts(&config)),
        config.orchestrator.to_config(),
        config.http.auth_token.clone(),
        require_bearer,
    );
    let app = build_router(state);

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(bind = %config.http.bind, "upsyncd control-plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server failed")
}

async fn enqueue(config_path: PathBuf, upload: NewUpload) -> Result<()> {
    let config = load_config(&config_path)?;
    let storage = open_storage(&config).await?;
    let record = storage.enqueue(&upload).await?;
    info!(upload_id = record.id, remote_path = %record.remote_path, "upload queued");
    println!("{}", record.id);
    Ok(())
}

async fn run_once(config_path: PathBuf, input: BatchInput) -> Result<()> {
    let config = load_config(&config_path)?;
    let storage = open_storage(&config).await?;
    let transport = Arc::new(MirrorTransport::new(config.transport.mirror_root.clone()));
    let conditions = Arc::new(StaticConditions::new(DeviceConditions::online()));

    let mut orchestrator = UploadOrchestrator::new(
        Arc::new(storage),
        transport.clone(),
        Arc::new(accounts(&config)),
        Gate::new(conditions, PauseSwitch::default()),
        Arc::new(LogSink),
        config.orchestrator.to_config(),
    )
    .with_hook(Arc::new(CollectionHook::new(transport)));

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("interrupt received; finishing the current upload");
        cancel.cancel();
    });

    let summary = orchestrator.run(input).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn requires_token(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_section_defaults_when_omitted() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [http]
            bind = "127.0.0.1:8787"

            [storage]
            sqlite_path = "upsync.db"

            [transport]
            mirror_root = "/srv/mirror"

            [accounts]
            names = ["alice", "bob"]
            "#,
        )
        .expect("config");

        let orchestrator = config.orchestrator.to_config();
        assert_eq!(orchestrator.milestone_every, 100);
        assert_eq!(orchestrator.batch_capacity, 500);
        assert_eq!(orchestrator.progress_interval, Duration::from_millis(750));
        assert!(orchestrator.executor.delay_in_power_save);
        assert_eq!(config.storage.retention_days, None);
    }

    #[test]
    fn loopback_binds_skip_bearer() {
        assert!(!requires_token("127.0.0.1:8787"));
        assert!(requires_token("0.0.0.0:8787"));
        assert!(requires_token("not-an-address"));
    }
}
