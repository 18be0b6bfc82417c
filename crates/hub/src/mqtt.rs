use std::time::{Duration, Instant};

use pump_engine::{ControlCommand, TelemetrySample, MOISTURE_PIN};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// A message published by the bridge under `bridge/<device_id>/...`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BridgeTopic<'a> {
    /// "bridge/<device_id>/<pin>" with pin V0, V1 or V2.
    Pin { device_id: &'a str, pin: &'a str },
    /// "bridge/<device_id>/status" carrying "online"/"offline".
    Status { device_id: &'a str },
}

const VIRTUAL_PINS: &[&str] = &["V0", "V1", "V2"];

pub(crate) fn parse_topic(topic: &str) -> Option<BridgeTopic<'_>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[0] != "bridge" || parts[1].is_empty() {
        return None;
    }
    match parts[2] {
        "status" => Some(BridgeTopic::Status {
            device_id: parts[1],
        }),
        pin if VIRTUAL_PINS.contains(&pin) => Some(BridgeTopic::Pin {
            device_id: parts[1],
            pin,
        }),
        _ => None,
    }
}

/// Wildcard covering every pin and the status topic of one device.
pub(crate) fn subscription(device_id: &str) -> String {
    format!("bridge/{device_id}/+")
}

/// "bridge/<device_id>/<pin>/set".
pub(crate) fn command_topic(device_id: &str, cmd: &ControlCommand) -> String {
    format!("bridge/{device_id}/{}/set", cmd.pin.virtual_pin())
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Parse a moisture magnitude. Integral decimals ("512.0") are accepted and
/// rounded; anything non-numeric or non-finite is rejected.
pub(crate) fn parse_raw(payload: &[u8]) -> Result<i64, String> {
    let s = String::from_utf8_lossy(payload);
    let s = s.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Ok(v);
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v.round() as i64),
        _ => Err(format!("bad moisture payload '{s}'")),
    }
}

/// Parse a switch payload ("1"/"0", "true"/"false", "on"/"off").
pub(crate) fn parse_flag(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_lowercase();
    match s.as_str() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err(format!("bad switch payload '{s}'")),
    }
}

/// Parse an availability payload ("online"/"offline", or a flag).
pub(crate) fn parse_status(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_lowercase();
    match s.as_str() {
        "online" => Ok(true),
        "offline" => Ok(false),
        _ => parse_flag(s.as_bytes()).map_err(|_| format!("bad status payload '{s}'")),
    }
}

// ---------------------------------------------------------------------------
// Pin cache
// ---------------------------------------------------------------------------

/// Latest value of each bridge pin, assembled into a `TelemetrySample` on
/// every poll.
#[derive(Debug, Default)]
pub(crate) struct PinCache {
    raw_moisture: Option<i64>,
    manual_flag: Option<bool>,
    auto_flag: Option<bool>,
    reported_online: Option<bool>,
    last_seen: Option<Instant>,
}

impl PinCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store a pin value received at `at`.
    pub(crate) fn update_pin(&mut self, pin: &str, payload: &[u8], at: Instant) -> Result<(), String> {
        match pin {
            p if p == MOISTURE_PIN => self.raw_moisture = Some(parse_raw(payload)?),
            "V1" => self.manual_flag = Some(parse_flag(payload)?),
            "V2" => self.auto_flag = Some(parse_flag(payload)?),
            other => return Err(format!("unknown pin '{other}'")),
        }
        self.last_seen = Some(at);
        Ok(())
    }

    pub(crate) fn raw_moisture(&self) -> Option<i64> {
        self.raw_moisture
    }

    pub(crate) fn set_status(&mut self, online: bool, at: Instant) {
        self.reported_online = Some(online);
        if online {
            self.last_seen = Some(at);
        }
    }

    /// `None` until every pin has been seen at least once. The device
    /// counts as offline once it reported so, or when nothing arrived
    /// within `stale_after`.
    pub(crate) fn sample(&self, now: Instant, stale_after: Duration) -> Option<TelemetrySample> {
        let fresh = self
            .last_seen
            .is_some_and(|t| now.saturating_duration_since(t) <= stale_after);
        Some(TelemetrySample {
            raw_moisture: self.raw_moisture?,
            manual_flag: self.manual_flag?,
            auto_flag: self.auto_flag?,
            device_online: fresh && self.reported_online != Some(false),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pump_engine::ControlPin;

    const STALE: Duration = Duration::from_secs(10);

    // -- parse_topic ----------------------------------------------------------

    #[test]
    fn parse_topic_pin() {
        assert_eq!(
            parse_topic("bridge/garden/V0"),
            Some(BridgeTopic::Pin {
                device_id: "garden",
                pin: "V0"
            })
        );
    }

    #[test]
    fn parse_topic_status() {
        assert_eq!(
            parse_topic("bridge/garden/status"),
            Some(BridgeTopic::Status { device_id: "garden" })
        );
    }

    #[test]
    fn parse_topic_unknown_pin() {
        assert_eq!(parse_topic("bridge/garden/V9"), None);
    }

    #[test]
    fn parse_topic_wrong_prefix() {
        assert_eq!(parse_topic("tele/garden/V0"), None);
    }

    #[test]
    fn parse_topic_own_command_echo_ignored() {
        assert_eq!(parse_topic("bridge/garden/V1/set"), None);
    }

    #[test]
    fn parse_topic_empty_device() {
        assert_eq!(parse_topic("bridge//V0"), None);
    }

    #[test]
    fn parse_topic_empty_string() {
        assert_eq!(parse_topic(""), None);
    }

    #[test]
    fn command_topic_uses_virtual_pin() {
        let cmd = ControlCommand::new(ControlPin::AutoControl, false);
        assert_eq!(command_topic("garden", &cmd), "bridge/garden/V2/set");
        assert_eq!(subscription("garden"), "bridge/garden/+");
    }

    // -- payloads ---------------------------------------------------------------

    #[test]
    fn parse_raw_integer_and_decimal() {
        assert_eq!(parse_raw(b"512"), Ok(512));
        assert_eq!(parse_raw(b" 512.0\n"), Ok(512));
        assert_eq!(parse_raw(b"-4"), Ok(-4));
    }

    #[test]
    fn parse_raw_rejects_garbage() {
        assert!(parse_raw(b"").is_err());
        assert!(parse_raw(b"wet").is_err());
        assert!(parse_raw(b"NaN").is_err());
        assert!(parse_raw(b"inf").is_err());
    }

    #[test]
    fn parse_flag_variants() {
        assert_eq!(parse_flag(b"1"), Ok(true));
        assert_eq!(parse_flag(b"0"), Ok(false));
        assert_eq!(parse_flag(b" ON "), Ok(true));
        assert_eq!(parse_flag(b"False"), Ok(false));
        assert!(parse_flag(b"2").is_err());
    }

    #[test]
    fn parse_status_variants() {
        assert_eq!(parse_status(b"online"), Ok(true));
        assert_eq!(parse_status(b"OFFLINE"), Ok(false));
        assert_eq!(parse_status(b"true"), Ok(true));
        assert!(parse_status(b"maybe").is_err());
    }

    // -- PinCache ---------------------------------------------------------------

    fn full_cache(at: Instant) -> PinCache {
        let mut c = PinCache::new();
        c.update_pin("V0", b"300", at).unwrap();
        c.update_pin("V1", b"0", at).unwrap();
        c.update_pin("V2", b"1", at).unwrap();
        c
    }

    #[test]
    fn incomplete_cache_yields_no_sample() {
        let now = Instant::now();
        let mut c = PinCache::new();
        c.update_pin("V0", b"300", now).unwrap();
        c.update_pin("V1", b"1", now).unwrap();
        assert!(c.sample(now, STALE).is_none());
    }

    #[test]
    fn complete_cache_yields_online_sample() {
        let now = Instant::now();
        let s = full_cache(now).sample(now, STALE).unwrap();
        assert_eq!(
            s,
            TelemetrySample {
                raw_moisture: 300,
                manual_flag: false,
                auto_flag: true,
                device_online: true,
            }
        );
    }

    #[test]
    fn quiet_bridge_goes_offline() {
        let then = Instant::now();
        let c = full_cache(then);
        let s = c.sample(then + Duration::from_secs(11), STALE).unwrap();
        assert!(!s.device_online);
    }

    #[test]
    fn reported_offline_wins_over_fresh_data() {
        let now = Instant::now();
        let mut c = full_cache(now);
        c.set_status(false, now);
        assert!(!c.sample(now, STALE).unwrap().device_online);

        c.set_status(true, now);
        assert!(c.sample(now, STALE).unwrap().device_online);
    }

    #[test]
    fn bad_payload_keeps_previous_value() {
        let now = Instant::now();
        let mut c = full_cache(now);
        assert!(c.update_pin("V0", b"garbage", now).is_err());
        assert_eq!(c.sample(now, STALE).unwrap().raw_moisture, 300);
    }

    #[test]
    fn unknown_pin_rejected() {
        let mut c = PinCache::new();
        assert!(c.update_pin("V7", b"1", Instant::now()).is_err());
    }
}
