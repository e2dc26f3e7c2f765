mod binding;
mod command;
mod config;
mod cycle;
mod db;
mod dli;
mod error;
mod garden;
mod growth;
mod housekeeping;
mod meter;
mod mqtt;
mod plant;
mod problem;
mod service;
mod slot;
mod species;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, path::Path, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{error, info, warn};

use db::{Db, PersistBatch};
use garden::Garden;
use mqtt::{
    extract_sensor_entity, parse_command, parse_sensor_payload, CMD_RESULT_TOPIC, CMD_TOPIC,
    SENSOR_TOPIC_FILTER,
};
use service::HubContext;
use species::CatalogLookup;
use state::{HubState, SourceCache};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:plant-hub.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env_or("WEB_PORT", 8080);
    let tick_sec = env_or::<u64>("TICK_INTERVAL_SEC", 60).max(1);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file ─────────────────────────────────────────────────
    let cfg = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found; starting from persisted state only");
        config::Config::default()
    };

    // ── Rehydrate ───────────────────────────────────────────────────
    // The database is the source of truth; the config only fills gaps.
    let now = OffsetDateTime::now_utc();
    let stored_settings = db.load_settings().await?;
    let fresh_settings = stored_settings.is_none();
    let settings = stored_settings.or(cfg.settings).unwrap_or_default();
    let plants = db.load_plants().await?;
    let cycles = db.load_cycles().await?;
    info!(plants = plants.len(), cycles = cycles.len(), "state loaded");

    let mut garden = Garden::restore(settings, plants, cycles, now);
    let mut sources = SourceCache::default();
    let mut changes = config::apply(&cfg, &mut garden, &mut sources, now)?;
    changes.settings |= fresh_settings;
    db.write_batch(&PersistBatch::collect(&garden, &changes))
        .await?;

    let mut hub = HubState::new(garden, sources);
    hub.record_system("hub started".to_string());
    let ctx = HubContext::new(
        hub.into_shared(),
        db,
        Arc::new(CatalogLookup::new(cfg.species)),
    );

    // ── Web server ──────────────────────────────────────────────────
    let web_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_ctx, web_port).await {
            error!(error = %format!("{e:#}"), "web server stopped");
        }
    });

    // ── Housekeeping ────────────────────────────────────────────────
    let hk_ctx = ctx.clone();
    tokio::spawn(async move {
        housekeeping::run(hk_ctx, Duration::from_secs(tick_sec)).await;
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("plant-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    client.subscribe(SENSOR_TOPIC_FILTER, QoS::AtLeastOnce).await?;
    client.subscribe(CMD_TOPIC, QoS::AtLeastOnce).await?;
    info!("hub subscribed to {SENSOR_TOPIC_FILTER} and {CMD_TOPIC}");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.clone();

                if topic == CMD_TOPIC {
                    handle_command(&ctx, &client, &p.payload).await;
                } else if let Some(entity_id) = extract_sensor_entity(&topic) {
                    let parsed = parse_sensor_payload(&p.payload).and_then(|msg| {
                        let ts = msg.timestamp(OffsetDateTime::now_utc())?;
                        Ok((msg.value, ts))
                    });
                    match parsed {
                        Ok((value, ts)) => {
                            service::ingest(&ctx, &entity_id, value, ts).await;
                        }
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "bad sensor payload");
                            let mut st = ctx.shared.write().await;
                            st.record_error(format!("{topic}: {e}"));
                        }
                    }
                } else {
                    warn!(topic = %topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = ctx.shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = ctx.shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "mqtt error; reconnecting");
                let mut st = ctx.shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Commands are applied in arrival order; the result goes back out on
/// `plant/cmd/result`.
async fn handle_command(ctx: &HubContext, client: &AsyncClient, payload: &[u8]) {
    let body = match parse_command(payload) {
        Ok(cmd) => {
            let name = cmd.name();
            match service::execute(ctx, cmd).await {
                Ok(reply) => serde_json::json!({ "command": name, "reply": reply }),
                Err(e) => serde_json::json!({ "command": name, "error": e.to_string() }),
            }
        }
        Err(e) => {
            warn!(error = %e, "bad command payload");
            ctx.shared.write().await.record_error(e.clone());
            serde_json::json!({ "error": e })
        }
    };
    publish_result(client, &body);
}

/// Never awaits: the event loop that drains the request queue is the
/// caller.
fn publish_result(client: &AsyncClient, body: &serde_json::Value) {
    if let Err(e) = client.try_publish(CMD_RESULT_TOPIC, QoS::AtLeastOnce, false, body.to_string()) {
        error!(error = %e, "failed to publish command result");
    }
}
