//! `monapps-sub` — the MQTT subscriber loop (§4.10-4.11): wires the library
//! to a real broker and a real embedded store, and drives the periodic
//! executor/updater sweeps as tokio tasks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use monapps_core::app_executor::{self, AppFunctionRegistry};
use monapps_core::config::{self, Config};
use monapps_core::raw_data;
use monapps_core::repo::{Repo, SharedRepo};
use monapps_core::scheduling::PendingPublish;
use monapps_core::store;
use monapps_core::tree_updater;

#[derive(Parser, Debug)]
#[command(name = "monapps-sub", about = "Monapps MQTT subscriber and evaluation engine")]
struct CliArgs {
    /// Path to a TOML config file (overrides MONAPPS_CONFIG / ./monapps.toml).
    #[arg(long, env = "MONAPPS_CONFIG")]
    config: Option<PathBuf>,

    /// MQTT broker URL, e.g. `tcp://localhost:1883` (overrides config).
    #[arg(long)]
    mqtt_url: Option<String>,

    /// Directory the embedded store opens its database in.
    #[arg(long, default_value = "./monapps-data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,monapps_sub=debug")),
        )
        .json()
        .init();

    let args = CliArgs::parse();

    let mut cfg = match &args.config {
        Some(path) => Config::load_from_file(path).unwrap_or_else(|e| {
            warn!(error = %e, path = %path.display(), "failed to load --config, falling back to env/defaults");
            Config::load()
        }),
        None => Config::load(),
    };
    if let Some(url) = args.mqtt_url.clone() {
        cfg.mqtt.broker_url = url;
    }
    config::init(cfg);

    store::open(&args.data_dir)?;
    let repo: SharedRepo = Arc::new(Repo::open()?);

    let (publish_tx, publish_rx) = mpsc::unbounded_channel::<PendingPublish>();

    let registry: AppFunctionRegistry = AppFunctionRegistry::new();
    if registry.is_empty() {
        info!("no application functions registered; application ticks will be no-ops until the embedding deployment registers one");
    }

    let mqtt_client = spawn_mqtt_ingress(repo.clone(), publish_tx.clone())?;
    tokio::spawn(run_publisher_dispatcher(mqtt_client, publish_rx));
    tokio::spawn(run_app_executor_sweep(repo.clone(), registry, publish_tx.clone()));
    tokio::spawn(run_device_updater_loop(repo.clone(), publish_tx.clone()));
    tokio::spawn(run_asset_updater_loop(repo.clone(), publish_tx.clone()));
    tokio::spawn(run_ds_health_loop(repo.clone(), publish_tx.clone()));

    serve_health(repo).await?;

    Ok(())
}

/// Connects to the broker and subscribes `mqtt.raw_topic_filter`; every
/// incoming publish is decoded (§6) and handed to C4. Returns a client
/// handle the publisher dispatcher reuses for egress.
fn spawn_mqtt_ingress(repo: SharedRepo, publish_tx: mpsc::UnboundedSender<PendingPublish>) -> anyhow::Result<AsyncClient> {
    let mqtt_cfg = &config::get().mqtt;
    let (host, port) = parse_broker_url(&mqtt_cfg.broker_url)?;

    let mut mqttoptions = MqttOptions::new(
        format!("{}-sub", config::get().instance_id.0),
        host,
        port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 256);
    let sub_client = client.clone();
    let raw_topic_filter = mqtt_cfg.raw_topic_filter.clone();

    tokio::spawn(async move {
        if let Err(e) = sub_client.subscribe(&raw_topic_filter, QoS::AtLeastOnce).await {
            error!(error = %e, "failed to subscribe to raw-data topic");
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let now = now_ms();
                    for (dev_ui, payload) in raw_data::decode_mqtt_payload(&topic, &publish.payload[..]) {
                        let dev_ui = dev_ui.to_lowercase();
                        if let Err(e) = raw_data::process_device_payload(&repo, &publish_tx, &dev_ui, payload, now).await {
                            error!(error = %e, dev_ui, "failed to process device payload");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "mqtt event loop error, alarm-logging and retrying");
                }
            }
        }
    });

    Ok(client)
}

fn parse_broker_url(url: &str) -> anyhow::Result<(String, u16)> {
    let without_scheme = url.rsplit("://").next().unwrap_or(url);
    let (host, port) = without_scheme
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("mqtt broker url {url} must be host:port"))?;
    Ok((host.to_string(), port.parse()?))
}

/// Drains the publish-on-save queue, sleeping `publish_delay_ms` per entry
/// before handing off to the broker (§4.10's deferred-handoff dispatcher,
/// not a wall-clock sleep held under a row lock).
async fn run_publisher_dispatcher(client: AsyncClient, mut rx: mpsc::UnboundedReceiver<PendingPublish>) {
    let delay = Duration::from_millis(config::get().mqtt.publish_delay_ms);
    while let Some(pending) = rx.recv().await {
        tokio::time::sleep(delay).await;
        let body = match serde_json::to_vec(&pending.payload) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, topic = %pending.topic, "failed to serialize publish payload");
                continue;
            }
        };
        if let Err(e) = client.publish(&pending.topic, QoS::AtLeastOnce, false, body).await {
            error!(error = %e, topic = %pending.topic, "failed to publish, alarm-logging");
        }
    }
}

async fn run_app_executor_sweep(repo: SharedRepo, registry: AppFunctionRegistry, publish_tx: mpsc::UnboundedSender<PendingPublish>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        let now = now_ms();
        let Ok(app_ids) = repo.applications_due_for_invocation(now).await else {
            continue;
        };
        for app_id in app_ids {
            if let Err(e) = app_executor::run_application_tick(&repo, &registry, &publish_tx, app_id, now).await {
                error!(error = %e, app_id, "application tick failed");
            }
        }
    }
}

async fn run_device_updater_loop(repo: SharedRepo, publish_tx: mpsc::UnboundedSender<PendingPublish>) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tick.tick().await;
        let now = now_ms();
        if let Err(e) = tree_updater::run_device_updater(&repo, &publish_tx, now).await {
            error!(error = %e, "device updater sweep failed");
        }
    }
}

async fn run_asset_updater_loop(repo: SharedRepo, publish_tx: mpsc::UnboundedSender<PendingPublish>) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tick.tick().await;
        let now = now_ms();
        if let Err(e) = tree_updater::run_asset_updater(&repo, &publish_tx, now).await {
            error!(error = %e, "asset updater sweep failed");
        }
    }
}

async fn run_ds_health_loop(repo: SharedRepo, publish_tx: mpsc::UnboundedSender<PendingPublish>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        let now = now_ms();
        if let Err(e) = raw_data::run_ds_health_sweep(&repo, &publish_tx, now).await {
            error!(error = %e, "ds-health sweep failed");
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `/health` + `/metrics` only, per the Non-goal that excludes the full
/// read-only API: just enough for a liveness probe and operational counters.
async fn serve_health(repo: SharedRepo) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(repo);

    let addr: SocketAddr = "0.0.0.0:8089".parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health/metrics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics_handler(axum::extract::State(repo): axum::extract::State<SharedRepo>) -> Json<serde_json::Value> {
    let enabled_apps = repo.enabled_application_ids().await.map(|v| v.len()).unwrap_or(0);
    debug!(enabled_apps, "metrics polled");
    Json(serde_json::json!({"enabled_applications": enabled_apps}))
}
