//! devfleet CLI - Main entry point for CLI binary
//!
//! This binary runs the update server, the operator commands and the device agent.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use devfleet_lib::engine::{
    api::{spawn_server, ApiState},
    audit::AuditLog,
    cli::{
        formatter::{format_duration, format_size, format_time, CliFormatter},
        AgentAction, Cli, Commands, DevicesAction, KeysAction, OutputFormat, RemoteArgs,
        UpdatesAction,
    },
    config::{Config, LoggingConfig},
    database::Database,
    keystore::Keystore,
    locks::{LockType, OperationLock},
    logging::init_tracing,
    models::UpdatePolicy,
    publisher::{OperatorClient, PublishOptions, Publisher},
    registry::{BlobStore, DeviceRegistry, UpdateRegistry},
    updater::{activity::IdleTracker, CycleContext, CycleOutcome, UpdateAgent},
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    let json_output = cli.format == OutputFormat::Json;

    // Commands that do not strictly need a config still honour its logging section
    let config = Config::load(&config_path).ok();
    init_tracing(
        &config
            .as_ref()
            .map(|c| c.logging.clone())
            .unwrap_or_else(LoggingConfig::default),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    match cli.command {
        Commands::Init { force } => cmd_init(&config_path, force, json_output),
        Commands::Serve { port, host } => {
            let config = require_config(config, &config_path)?;
            runtime.block_on(cmd_serve(&config, host, port))
        }
        Commands::Keys { action } => {
            let config = require_config(config, &config_path)?;
            cmd_keys(action, &config, json_output)
        }
        Commands::Publish {
            version,
            source,
            description,
            policy,
            system_packages,
            dependency_manifest,
            protected_manifest,
            remote,
        } => {
            let options = PublishOptions {
                version,
                description,
                policy,
                requires_system_packages: None,
                system_packages,
                dependency_manifest,
                protected_manifest,
            };
            runtime.block_on(cmd_publish(&source, options, &remote, json_output))
        }
        Commands::Updates { action, remote } => {
            runtime.block_on(cmd_updates(action, &remote, json_output))
        }
        Commands::Devices { action, remote } => {
            runtime.block_on(cmd_devices(action, &remote, json_output))
        }
        Commands::Agent { action } => {
            let config = require_config(config, &config_path)?;
            runtime.block_on(cmd_agent(action, &config, json_output))
        }
    }
}

fn require_config(config: Option<Config>, path: &Path) -> Result<Config> {
    match config {
        Some(config) => Ok(config),
        // Load again for the real error
        None => Config::load(path).with_context(|| format!("loading {}", path.display())),
    }
}

fn operator_client(remote: &RemoteArgs) -> Result<OperatorClient> {
    let Some(api_key) = remote.api_key.as_deref().filter(|k| !k.is_empty()) else {
        bail!("an operator key is required: pass --api-key or set DEVFLEET_API_KEY");
    };
    Ok(OperatorClient::new(&remote.server, api_key)?)
}

fn cmd_init(config_path: &Path, force: bool, json: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    let config = Config::default_server();
    config.save(config_path)?;

    if json {
        CliFormatter::json(&json!({
            "success": true,
            "config": config_path.display().to_string(),
        }))?;
    } else {
        CliFormatter::success(&format!("Wrote {}", config_path.display()));
        CliFormatter::info("Next steps:");
        CliFormatter::item("devfleet keys create --name ci");
        CliFormatter::item("devfleet serve");
    }
    Ok(())
}

async fn cmd_serve(config: &Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let server = config.server()?;
    let host = host.unwrap_or_else(|| server.host.clone());
    let port = port.unwrap_or(server.port);
    let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), port))
        .await
        .with_context(|| format!("invalid listen address {}:{}", host, port))?
        .next()
        .with_context(|| format!("{} did not resolve", host))?;

    let db_path = config.resolve(&server.database_path);
    let data_dir = db_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let _lock = OperationLock::new(&data_dir).acquire(LockType::Serve)?;

    let db = Database::new(&db_path)?;
    let blobs = BlobStore::open(&config.resolve(&server.blob_dir))?;
    let state = ApiState {
        devices: DeviceRegistry::new(db.clone()),
        updates: UpdateRegistry::new(db, blobs),
        keystore: Keystore::new(&config.resolve(&server.keystore_path)),
        audit: Arc::new(AuditLog::open(&config.resolve(&server.audit_log_path))?),
        max_package_bytes: server.max_package_bytes,
    };

    let handle = spawn_server(state, addr).await?;
    CliFormatter::success("devfleet update server");
    CliFormatter::kv("Listening", &format!("http://{}", handle.addr()));
    CliFormatter::kv("Database", &db_path.display().to_string());
    CliFormatter::kv("OpenAPI", &format!("http://{}/api/openapi.json", handle.addr()));
    CliFormatter::info("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown().await?;
    Ok(())
}

fn cmd_keys(action: KeysAction, config: &Config, json: bool) -> Result<()> {
    let keystore = Keystore::new(&config.resolve(&config.server()?.keystore_path));

    match action {
        KeysAction::List => {
            let keys = keystore.list_api_keys()?;
            if json {
                // Hashes stay on the server
                let keys: Vec<_> = keys
                    .iter()
                    .map(|k| json!({ "id": k.id, "name": k.name, "created_at": k.created_at }))
                    .collect();
                CliFormatter::json(&keys)?;
            } else if keys.is_empty() {
                CliFormatter::info("No operator keys");
            } else {
                CliFormatter::table_header(&["ID", "Name", "Created"]);
                for key in &keys {
                    CliFormatter::table_row(&[&key.id, &key.name, &format_time(Some(key.created_at))]);
                }
            }
        }
        KeysAction::Create { name } => {
            let (raw_key, key_info) = keystore.create_api_key(&name)?;
            if json {
                CliFormatter::json(&json!({
                    "key": raw_key,
                    "id": key_info.id,
                    "name": key_info.name,
                }))?;
            } else {
                CliFormatter::success("Created operator key");
                CliFormatter::kv("ID", &key_info.id);
                CliFormatter::kv("Name", &key_info.name);
                CliFormatter::warning("Save this key, it is shown only once:");
                println!("  {}", raw_key);
            }
        }
        KeysAction::Revoke { key_id } => {
            let revoked = keystore.revoke_api_key(&key_id)?;
            if json {
                CliFormatter::json(&json!({ "success": revoked, "key_id": key_id }))?;
            } else if revoked {
                CliFormatter::success(&format!("Revoked key {}", key_id));
            } else {
                CliFormatter::warning(&format!("Key not found: {}", key_id));
            }
        }
    }
    Ok(())
}

async fn cmd_publish(
    source: &Path,
    options: PublishOptions,
    remote: &RemoteArgs,
    json: bool,
) -> Result<()> {
    let publisher = Publisher::new(operator_client(remote)?);
    let report = publisher.publish(source, &options).await?;

    if json {
        CliFormatter::json(&report.record)?;
    } else {
        CliFormatter::success(&format!("Published {}", report.record.version));
        CliFormatter::kv("Files", &report.file_count.to_string());
        CliFormatter::kv("Size", &format_size(report.record.package_size));
        CliFormatter::kv("Checksum", &report.record.package_checksum);
        CliFormatter::kv("Policy", report.record.policy.as_str());
        if !report.has_dependency_manifest {
            CliFormatter::warning("No requirements.txt in the package");
        }
        if report.record.policy == UpdatePolicy::Urgent {
            CliFormatter::info("Devices install once they have been idle long enough");
        }
    }
    Ok(())
}

async fn cmd_updates(action: UpdatesAction, remote: &RemoteArgs, json: bool) -> Result<()> {
    let client = operator_client(remote)?;
    match action {
        UpdatesAction::List => {
            let updates = client.list_updates().await?;
            if json {
                CliFormatter::json(&updates)?;
            } else {
                CliFormatter::updates(&updates);
            }
        }
        UpdatesAction::Show { version } => {
            let update = client.get_update(&version).await?;
            if json {
                CliFormatter::json(&update)?;
            } else {
                CliFormatter::update(&update);
            }
        }
    }
    Ok(())
}

async fn cmd_devices(action: DevicesAction, remote: &RemoteArgs, json: bool) -> Result<()> {
    let client = operator_client(remote)?;
    let device = match action {
        DevicesAction::List => {
            let devices = client.list_devices().await?;
            if json {
                CliFormatter::json(&devices)?;
            } else {
                CliFormatter::devices(&devices);
            }
            return Ok(());
        }
        DevicesAction::Show { uuid } => client.get_device(&uuid).await?,
        DevicesAction::Deactivate { uuid } => client.deactivate(&uuid).await?,
        DevicesAction::Reactivate { uuid } => client.reactivate(&uuid).await?,
    };

    if json {
        CliFormatter::json(&device)?;
    } else {
        CliFormatter::device(&device);
    }
    Ok(())
}

async fn cmd_agent(action: AgentAction, config: &Config, json: bool) -> Result<()> {
    let mut agent = UpdateAgent::from_config(config)?;

    match action {
        AgentAction::Run => {
            let activity = IdleTracker::new(Utc::now()).with_stamp_file(&agent.layout().activity_path());
            let cancel = agent.cancel_token();
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, stopping agent");
                }
                // A download in flight is abandoned; an install runs to completion
                cancel.cancel();
                let _ = stop_tx.send(());
            });
            agent
                .run(&activity, async {
                    let _ = stop_rx.await;
                })
                .await;
        }
        AgentAction::Check { idle_minutes } => {
            agent.register().await?;
            let now = Utc::now();
            let idle_for = match idle_minutes {
                Some(minutes) => Duration::from_secs(minutes.saturating_mul(60)),
                None => IdleTracker::new(now)
                    .with_stamp_file(&agent.layout().activity_path())
                    .idle_for(now),
            };
            let outcome = agent.run_cycle(CycleContext { now, idle_for }).await;
            print_outcome(&outcome, json)?;
            if let CycleOutcome::Failed { message, .. } = outcome {
                bail!(message);
            }
        }
        AgentAction::Status => {
            let state = agent.state();
            if json {
                CliFormatter::json(&json!({ "uuid": agent.uuid(), "state": state }))?;
            } else {
                CliFormatter::header("Agent status");
                CliFormatter::kv("UUID", agent.uuid());
                CliFormatter::kv("Phase", &CliFormatter::phase(&state.phase).to_string());
                CliFormatter::kv("Version", &state.current_version.to_string());
                CliFormatter::kv("Last check", &format_time(state.last_check));
                if let Some(error) = &state.last_error {
                    CliFormatter::kv("Last error", error);
                    CliFormatter::kv("Failures", &state.consecutive_failures.to_string());
                }
                if let Some(until) = state.backoff_until.filter(|u| *u > Utc::now()) {
                    CliFormatter::kv("Next attempt in", &format_duration(until - Utc::now()));
                }
            }
        }
    }
    Ok(())
}

fn print_outcome(outcome: &CycleOutcome, json: bool) -> Result<()> {
    if json {
        let value = match outcome {
            CycleOutcome::UpToDate { version } => json!({ "outcome": "up_to_date", "version": version }),
            CycleOutcome::Deferred { version, reason } => json!({
                "outcome": "deferred",
                "version": version,
                "reason": reason.to_string(),
            }),
            CycleOutcome::Installed { from, to } => {
                json!({ "outcome": "installed", "from": from, "to": to })
            }
            CycleOutcome::BackingOff { until } => json!({ "outcome": "backing_off", "until": until }),
            CycleOutcome::Cancelled => json!({ "outcome": "cancelled" }),
            CycleOutcome::Failed { kind, message } => {
                json!({ "outcome": "failed", "kind": kind, "message": message })
            }
        };
        CliFormatter::json(&value)?;
        return Ok(());
    }

    match outcome {
        CycleOutcome::UpToDate { version } => CliFormatter::success(&format!("Up to date ({})", version)),
        CycleOutcome::Deferred { version, reason } => {
            CliFormatter::info(&format!("{} available, deferred: {}", version, reason))
        }
        CycleOutcome::Installed { from, to } => {
            CliFormatter::success(&format!("Installed {} (was {})", to, from))
        }
        CycleOutcome::BackingOff { until } => {
            CliFormatter::warning(&format!("Backing off until {}", format_time(Some(*until))))
        }
        CycleOutcome::Cancelled => CliFormatter::warning("Cancelled"),
        // Reported by the caller
        CycleOutcome::Failed { .. } => {}
    }
    Ok(())
}
