//! Simulated pump bridge for local development.
//!
//! Stands in for the hardware on the same broker: publishes V0/V1/V2 and
//! an "online" status for one device and obeys `<pin>/set` commands.
//! Soil moisture wanders by up to 5 % per step and climbs while the pump
//! runs. The bridge's own auto rule waters below a fixed threshold taken
//! at startup.

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use pump_engine::{CalibrationConfig, MOISTURE_PIN};

use crate::mqtt;

/// Largest random change per step, in percent.
const DRIFT: i32 = 5;
/// Extra rise per step while watering, in percent.
const WATERING_GAIN: i32 = 3;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

pub(crate) struct BridgeSim {
    rng: fastrand::Rng,
    percent: i32,
    manual: bool,
    auto: bool,
    threshold: i32,
    adc_max: u32,
    invert: bool,
}

impl BridgeSim {
    pub(crate) fn new(calibration: &CalibrationConfig, threshold: u8) -> Self {
        Self::with_rng(fastrand::Rng::new(), calibration, threshold)
    }

    fn with_rng(rng: fastrand::Rng, calibration: &CalibrationConfig, threshold: u8) -> Self {
        Self {
            rng,
            percent: 50,
            manual: false,
            auto: true,
            threshold: i32::from(threshold),
            adc_max: calibration.adc_max(),
            invert: calibration.invert(),
        }
    }

    pub(crate) fn pump_on(&self) -> bool {
        self.manual || (self.auto && self.percent < self.threshold)
    }

    /// Advance the soil by one step.
    pub(crate) fn step(&mut self) {
        let drift = self.rng.i32(-DRIFT..=DRIFT);
        let wet = if self.pump_on() { WATERING_GAIN } else { 0 };
        self.percent = (self.percent + drift + wet).clamp(0, 100);
    }

    /// The V0 value a sensor at the current moisture would report.
    pub(crate) fn raw(&self) -> u32 {
        let raw = (f64::from(self.adc_max) * f64::from(self.percent) / 100.0).round() as u32;
        if self.invert {
            self.adc_max - raw
        } else {
            raw
        }
    }

    /// Apply a write to V1 or V2.
    pub(crate) fn apply(&mut self, pin: &str, payload: &[u8]) -> Result<(), String> {
        let on = mqtt::parse_flag(payload)?;
        match pin {
            "V1" => self.manual = on,
            "V2" => self.auto = on,
            other => return Err(format!("pin {other} is read-only")),
        }
        Ok(())
    }
}

/// Pin named by "bridge/<device_id>/<pin>/set", if addressed to `device_id`.
pub(crate) fn command_pin<'a>(topic: &'a str, device_id: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["bridge", dev, pin, "set"] if *dev == device_id && !pin.is_empty() => Some(*pin),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// MQTT loop
// ---------------------------------------------------------------------------

async fn publish_pins(client: &AsyncClient, device_id: &str, sim: &BridgeSim) -> Result<()> {
    let pins = [
        (MOISTURE_PIN, sim.raw().to_string()),
        ("V1", u8::from(sim.manual).to_string()),
        ("V2", u8::from(sim.auto).to_string()),
        ("status", "online".to_string()),
    ];
    for (pin, value) in pins {
        client
            .publish(format!("bridge/{device_id}/{pin}"), QoS::AtMostOnce, false, value)
            .await
            .with_context(|| format!("sim bridge: publish {pin} failed"))?;
    }
    Ok(())
}

/// Run the simulated bridge until the process exits. Intended to be
/// `tokio::spawn`-ed from main.
pub async fn run(
    broker: String,
    port: u16,
    device_id: String,
    calibration: CalibrationConfig,
    threshold: u8,
    interval: Duration,
) -> Result<()> {
    let mut opts = MqttOptions::new("pump-bridge-sim", broker.as_str(), port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 20);

    let topic = format!("bridge/{device_id}/+/set");
    client
        .subscribe(topic.as_str(), QoS::AtLeastOnce)
        .await
        .with_context(|| format!("sim bridge: failed to subscribe to {topic}"))?;

    let (tx, mut rx) = mpsc::channel::<(String, Vec<u8>)>(16);
    let resubscribe = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if tx.send((p.topic, p.payload.to_vec())).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Err(e) = resubscribe.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!(%topic, "sim bridge: resubscribe failed: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("sim bridge: mqtt error: {e}");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let mut sim = BridgeSim::new(&calibration, threshold);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(%device_id, interval_sec = interval.as_secs(), "simulated bridge started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sim.step();
                debug!(percent = sim.percent, pump_on = sim.pump_on(), "sim bridge: step");
            }
            Some((topic, payload)) = rx.recv() => {
                let Some(pin) = command_pin(&topic, &device_id) else {
                    continue;
                };
                if let Err(msg) = sim.apply(pin, &payload) {
                    warn!(%topic, "sim bridge: {msg}");
                    continue;
                }
                info!(pin, pump_on = sim.pump_on(), "sim bridge: command applied");
            }
        }
        if let Err(e) = publish_pins(&client, &device_id, &sim).await {
            warn!("{e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(threshold: u8) -> BridgeSim {
        BridgeSim::with_rng(
            fastrand::Rng::with_seed(7),
            &CalibrationConfig::default(),
            threshold,
        )
    }

    // -- Soil -------------------------------------------------------------

    #[test]
    fn watering_raises_moisture() {
        let mut sim = seeded(0);
        sim.percent = 10;
        sim.apply("V1", b"1").unwrap();
        for _ in 0..100 {
            sim.step();
        }
        assert!(sim.percent > 50, "moisture stayed at {}", sim.percent);
    }

    #[test]
    fn moisture_stays_in_range() {
        let mut sim = seeded(30);
        for _ in 0..1000 {
            sim.step();
            assert!((0..=100).contains(&sim.percent));
        }
    }

    #[test]
    fn auto_waters_below_threshold_only() {
        let mut sim = seeded(30);
        sim.percent = 29;
        assert!(sim.pump_on());
        sim.percent = 30;
        assert!(!sim.pump_on());
        sim.apply("V2", b"0").unwrap();
        sim.percent = 5;
        assert!(!sim.pump_on());
    }

    // -- Pins -------------------------------------------------------------

    #[test]
    fn raw_follows_calibration() {
        let mut sim = seeded(30);
        sim.percent = 40;
        assert_eq!(sim.raw(), 409);

        let inverted = CalibrationConfig::new(4095, true, 20, 80).unwrap();
        let mut sim = BridgeSim::with_rng(fastrand::Rng::with_seed(1), &inverted, 30);
        sim.percent = 100;
        assert_eq!(sim.raw(), 0);
        sim.percent = 0;
        assert_eq!(sim.raw(), 4095);
    }

    #[test]
    fn moisture_pin_is_read_only() {
        let mut sim = seeded(30);
        assert!(sim.apply("V0", b"1").is_err());
        assert!(sim.apply("V1", b"maybe").is_err());
        sim.apply("V1", b"on").unwrap();
        assert!(sim.manual);
    }

    #[test]
    fn command_topics() {
        assert_eq!(command_pin("bridge/garden/V1/set", "garden"), Some("V1"));
        assert_eq!(command_pin("bridge/garden/V2/set", "garden"), Some("V2"));
        assert_eq!(command_pin("bridge/other/V1/set", "garden"), None);
        assert_eq!(command_pin("bridge/garden/V1", "garden"), None);
        assert_eq!(command_pin("bridge/garden//set", "garden"), None);
    }
}
