mod config;
mod mqtt;
mod poller;
#[cfg(feature = "sim")]
mod sim;
mod sink;
mod state;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration, time::Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mqtt::BridgeTopic;
use state::{SharedState, SystemState};

/// Queued commands waiting for the sink.
const COMMAND_QUEUE: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let settings = config::load(&config_path)?;
    let device_id = settings.bridge.device_id.clone();

    // ── Simulated bridge (SIM_BRIDGE=1) ─────────────────────────────
    #[cfg(feature = "sim")]
    if env::var("SIM_BRIDGE").is_ok_and(|v| matches!(v.trim(), "1" | "true")) {
        let run = sim::run(
            broker.clone(),
            port,
            device_id.clone(),
            settings.calibration.clone(),
            settings.pump.moisture_threshold(),
            settings.bridge.poll_interval,
        );
        tokio::spawn(async move {
            if let Err(e) = run.await {
                error!("simulated bridge stopped: {e:#}");
            }
        });
    }

    // ── Shared state ────────────────────────────────────────────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::with_settings(settings)));
    {
        let mut st = shared.write().await;
        st.record_system(format!("hub started for bridge '{device_id}'"));
    }

    let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);

    // ── Web API ─────────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        commands: commands.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state).await {
            error!("web api stopped: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("pump-hub", broker.as_str(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    let topic = mqtt::subscription(&device_id);
    client
        .subscribe(topic.as_str(), QoS::AtLeastOnce)
        .await
        .with_context(|| format!("failed to subscribe to {topic}"))?;
    info!(%broker, port, %topic, "hub subscribed");

    // ── Command sink + poller ───────────────────────────────────────
    tokio::spawn(sink::run(
        command_rx,
        client.clone(),
        device_id.clone(),
        Arc::clone(&shared),
    ));
    tokio::spawn(poller::run(Arc::clone(&shared), commands));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(parsed) = mqtt::parse_topic(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };

                let mut st = shared.write().await;
                let result = match parsed {
                    BridgeTopic::Pin { device_id: dev, pin } if dev == device_id => {
                        st.pins.update_pin(pin, &p.payload, Instant::now())
                    }
                    BridgeTopic::Status { device_id: dev } if dev == device_id => {
                        mqtt::parse_status(&p.payload).map(|online| {
                            info!(online, "bridge status");
                            st.pins.set_status(online, Instant::now());
                        })
                    }
                    _ => {
                        debug!(topic = %p.topic, "message for another device");
                        Ok(())
                    }
                };
                if let Err(msg) = result {
                    warn!(topic = %p.topic, "{msg}");
                    st.record_error(format!("{msg} on {}", p.topic));
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // A clean session drops subscriptions on reconnect.
                if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                    error!(%topic, "mqtt resubscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");

                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
