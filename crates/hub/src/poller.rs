//! Telemetry poller: turns the cached bridge pins into a `TelemetrySample`
//! at a fixed cadence and drives `Engine::tick`.
//!
//! The poller never talks to the bridge itself. Pin values arrive through
//! the MQTT loop in `main`; outbound commands are handed to the sink task.
//! A cycle whose pins are not all known yet is skipped without ticking.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use pump_engine::ControlCommand;

use crate::state::SharedState;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// Not every pin has reported yet.
    Skipped,
    Ticked(Option<ControlCommand>),
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the poll loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(shared: SharedState, commands: mpsc::Sender<ControlCommand>) {
    let (poll_interval, stale_after) = {
        let st = shared.read().await;
        (st.settings.bridge.poll_interval, st.settings.bridge.stale_after)
    };
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_sec = poll_interval.as_secs(),
        stale_after_sec = stale_after.as_secs(),
        "poller started"
    );
    {
        let mut st = shared.write().await;
        st.record_system(format!(
            "poller started (every {}s)",
            poll_interval.as_secs()
        ));
    }

    let mut last_tick: Option<Instant> = None;

    loop {
        ticker.tick().await;

        let at = Instant::now();
        let elapsed = last_tick.map_or(Duration::ZERO, |t| at.duration_since(t));

        match poll_once(&shared, OffsetDateTime::now_utc(), at, elapsed).await {
            PollOutcome::Skipped => {
                debug!("poller: telemetry incomplete, skipping cycle");
            }
            PollOutcome::Ticked(command) => {
                last_tick = Some(at);
                if let Some(cmd) = command {
                    if let Err(e) = commands.send(cmd).await {
                        error!("poller: command sink closed, dropping {}: {e}", cmd);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// One cycle
// ---------------------------------------------------------------------------

/// Build a sample and run one engine tick under the write lock, with the
/// settings active at that moment.
pub(crate) async fn poll_once(
    shared: &SharedState,
    now: OffsetDateTime,
    at: Instant,
    elapsed: Duration,
) -> PollOutcome {
    let mut guard = shared.write().await;
    let st = &mut *guard;

    let Some(sample) = st.pins.sample(at.into_std(), st.settings.bridge.stale_after) else {
        return PollOutcome::Skipped;
    };

    let elapsed_secs = elapsed.as_secs_f64().round() as u64;
    let (next, command) = st.engine.tick(
        &sample,
        now,
        elapsed_secs,
        &st.settings.calibration,
        &st.settings.pump,
    );

    debug!(
        raw = sample.raw_moisture,
        percent = next.reading.map(|r| r.percent),
        phase = %next.pump.phase,
        online = next.online,
        "poller: tick"
    );

    st.record_tick(next, command.as_ref());
    PollOutcome::Ticked(command)
}

// ===========================================================================
// Tests
// ===========================================================================
