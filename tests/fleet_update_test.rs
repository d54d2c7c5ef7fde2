use chrono::{TimeDelta, Utc};
use devfleet_lib::engine::api::{spawn_server, ApiServer, ApiState};
use devfleet_lib::engine::audit::{AuditAction, AuditLog};
use devfleet_lib::engine::database::Database;
use devfleet_lib::engine::error::ErrorKind;
use devfleet_lib::engine::keystore::Keystore;
use devfleet_lib::engine::models::{DeviceStatus, UpdatePolicy};
use devfleet_lib::engine::publisher::{OperatorClient, PublishError, PublishOptions, Publisher};
use devfleet_lib::engine::registry::{BlobStore, DeviceRegistry, UpdateRegistry};
use devfleet_lib::engine::updater::agent::AgentSettings;
use devfleet_lib::engine::updater::client::HttpUpdateSource;
use devfleet_lib::engine::updater::install::{CommandPackageManager, Installer};
use devfleet_lib::engine::updater::policy::{MaintenanceWindow, TimingPolicy};
use devfleet_lib::engine::updater::restart::MarkerRestarter;
use devfleet_lib::engine::updater::{
    CycleContext, CycleOutcome, ProtectedManifest, UpdateAgent, VersionManager,
};
use devfleet_lib::engine::version::Version;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const KITCHEN: &str = "6f9619ff-8b86-d011-b42d-00c04fc964ff";

async fn start_server(data: &Path) -> Result<(ApiServer, Arc<AuditLog>, String), Box<dyn std::error::Error>> {
    let db = Database::new(&data.join("devfleet.db"))?;
    let keystore = Keystore::new(&data.join("keys.json"));
    let (key, _) = keystore.create_api_key("release-bot")?;
    let audit = Arc::new(AuditLog::open(&data.join("audit.jsonl"))?);
    let state = ApiState {
        devices: DeviceRegistry::new(db.clone()),
        updates: UpdateRegistry::new(db, BlobStore::open(&data.join("packages"))?),
        keystore,
        audit: audit.clone(),
        max_package_bytes: 16 * 1024 * 1024,
    };
    let server = spawn_server(state, "127.0.0.1:0".parse()?).await?;
    Ok((server, audit, key))
}

fn device_agent(server_url: &str, app: &Path, state: &Path) -> Result<UpdateAgent, Box<dyn std::error::Error>> {
    let settings = AgentSettings {
        uuid: KITCHEN.to_string(),
        display_name: "Kitchen".to_string(),
        timezone: "America/Los_Angeles".to_string(),
        timing: TimingPolicy {
            timezone: chrono_tz::America::Los_Angeles,
            window: MaintenanceWindow {
                start_hour: 2,
                end_hour: 5,
            },
            urgent_idle: Duration::from_secs(60 * 60),
        },
        transfer_attempts: 2,
        backoff_base: TimeDelta::seconds(60),
        backoff_max: TimeDelta::seconds(3600),
        poll_interval: Duration::from_secs(300),
    };
    Ok(UpdateAgent::new(
        settings,
        Arc::new(HttpUpdateSource::new(server_url)?),
        VersionManager::new(app, state),
        Installer::new(app, ProtectedManifest::default()),
        Box::new(CommandPackageManager::new(vec!["true".to_string()])),
        Box::new(MarkerRestarter::new(&state.join("restart.requested"))),
    )?)
}

fn idle(minutes: u64) -> CycleContext {
    CycleContext {
        now: Utc::now(),
        idle_for: Duration::from_secs(minutes * 60),
    }
}

#[tokio::test]
async fn test_publish_and_install_over_http() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let (server, audit, key) = start_server(&root.path().join("server")).await?;
    let base_url = format!("http://{}", server.addr());

    // Release tree on the publisher's machine
    let release = root.path().join("release");
    fs::create_dir_all(release.join("audio"))?;
    fs::write(release.join("main.py"), "print('v1')")?;
    fs::write(release.join("audio/player.py"), "play()")?;
    fs::write(release.join("requirements.txt"), "requests==2.31\n")?;
    fs::write(release.join(".env"), "OPENAI_KEY=publisher-secret")?;

    // Device running the never-updated app
    let app = root.path().join("device/app");
    let state = root.path().join("device/state");
    fs::create_dir_all(&app)?;
    fs::write(app.join("main.py"), "print('v0')")?;
    fs::write(app.join(".env"), "OPENAI_KEY=device-secret")?;

    let mut agent = device_agent(&base_url, &app, &state)?;
    let device = agent.register().await?;
    assert_eq!(device.current_version, Version::SENTINEL);

    // Nothing published yet
    let outcome = agent.run_cycle(idle(0)).await;
    assert_eq!(outcome, CycleOutcome::UpToDate { version: Version::SENTINEL });

    let publisher = Publisher::new(OperatorClient::new(&base_url, &key)?);
    let options = PublishOptions {
        version: "v1.0.0".to_string(),
        description: "First release".to_string(),
        policy: UpdatePolicy::Urgent,
        ..Default::default()
    };
    let report = publisher.publish(&release, &options).await?;
    assert_eq!(report.record.version, Version::new(1, 0, 0));
    assert!(report.has_dependency_manifest);

    // Urgent update waits for the device to be idle long enough
    let outcome = agent.run_cycle(idle(30)).await;
    assert!(matches!(outcome, CycleOutcome::Deferred { .. }), "{outcome:?}");
    assert_eq!(fs::read_to_string(app.join("main.py"))?, "print('v0')");

    let outcome = agent.run_cycle(idle(61)).await;
    assert_eq!(
        outcome,
        CycleOutcome::Installed {
            from: Version::SENTINEL,
            to: Version::new(1, 0, 0)
        }
    );
    assert_eq!(fs::read_to_string(app.join("main.py"))?, "print('v1')");
    assert_eq!(fs::read_to_string(app.join("audio/player.py"))?, "play()");
    assert_eq!(fs::read_to_string(app.join("VERSION"))?, "v1.0.0\n");
    assert_eq!(fs::read_to_string(app.join(".env"))?, "OPENAI_KEY=device-secret");
    assert!(state.join("restart.requested").exists());

    let outcome = agent.run_cycle(idle(0)).await;
    assert_eq!(outcome, CycleOutcome::UpToDate { version: Version::new(1, 0, 0) });

    let operator = OperatorClient::new(&base_url, &key)?;
    let devices = operator.list_devices().await?;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].current_version, Version::new(1, 0, 0));
    assert_eq!(devices[0].status, DeviceStatus::Online);

    // Published versions are immutable
    let err = publisher.publish(&release, &options).await.unwrap_err();
    assert!(matches!(err, PublishError::Conflict(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let published = audit.query_by_subject("v1.0.0")?;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].action, AuditAction::UpdatePublished);
    assert_eq!(published[0].actor.as_deref(), Some("release-bot"));

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_deactivated_device_is_refused() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let (server, _audit, key) = start_server(&root.path().join("server")).await?;
    let base_url = format!("http://{}", server.addr());

    let app = root.path().join("app");
    fs::create_dir_all(&app)?;
    let mut agent = device_agent(&base_url, &app, &root.path().join("state"))?;
    agent.register().await?;

    let operator = OperatorClient::new(&base_url, &key)?;
    let device = operator.deactivate(KITCHEN).await?;
    assert_eq!(device.status, DeviceStatus::Disabled);

    let outcome = agent.run_cycle(idle(0)).await;
    assert!(
        matches!(
            outcome,
            CycleOutcome::Failed {
                kind: ErrorKind::Authorization,
                ..
            }
        ),
        "{outcome:?}"
    );

    operator.reactivate(KITCHEN).await?;
    // The failed cycle scheduled a backoff; a later cycle goes through
    let later = CycleContext {
        now: Utc::now() + chrono::Duration::hours(2),
        idle_for: Duration::ZERO,
    };
    let outcome = agent.run_cycle(later).await;
    assert_eq!(outcome, CycleOutcome::UpToDate { version: Version::SENTINEL });

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_operator_key_required() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let (server, _audit, _key) = start_server(&root.path().join("server")).await?;
    let base_url = format!("http://{}", server.addr());

    let health = OperatorClient::new(&base_url, "")?.health().await?;
    assert_eq!(health.status, "ok");

    let err = OperatorClient::new(&base_url, "dvf_not-a-key")?
        .list_updates()
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Unauthorized), "{err:?}");

    server.shutdown().await?;
    Ok(())
}
