//! Command sink: publishes `ControlCommand`s to the bridge over MQTT.
//!
//! Commands from the poller and the web API share one channel, so they
//! reach the bridge in the order they were issued. A failed publish is
//! retried a few times and then dropped. The engine is told about the
//! drop, so a stop is issued again on the next tick while the hardware
//! still runs.

use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use pump_engine::ControlCommand;

use crate::mqtt;
use crate::state::SharedState;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Drain the command channel until every sender is gone.
pub async fn run(
    mut rx: mpsc::Receiver<ControlCommand>,
    mqtt: AsyncClient,
    device_id: String,
    shared: SharedState,
) {
    info!(device_id = %device_id, "command sink started");
    while let Some(cmd) = rx.recv().await {
        deliver(&mqtt, &device_id, cmd, &shared, RETRY_DELAY).await;
    }
    warn!("command sink: channel closed, exiting");
}

/// Publish one command, retrying up to `MAX_ATTEMPTS` times. Returns
/// whether it was handed to the MQTT client.
pub(crate) async fn deliver(
    mqtt: &AsyncClient,
    device_id: &str,
    cmd: ControlCommand,
    shared: &SharedState,
    retry_delay: Duration,
) -> bool {
    let topic = mqtt::command_topic(device_id, &cmd);

    for attempt in 1..=MAX_ATTEMPTS {
        match mqtt
            .publish(topic.as_str(), QoS::AtLeastOnce, false, cmd.payload().to_vec())
            .await
        {
            Ok(()) => {
                info!(%topic, command = %cmd, attempt, "sink: command published");
                shared.write().await.record_command(&cmd);
                return true;
            }
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(%topic, attempt, "sink: publish failed, retrying: {e}");
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => {
                error!(%topic, attempt, "sink: giving up on {cmd}: {e}");
                let mut st = shared.write().await;
                st.engine.command_failed(&cmd);
                st.record_error(format!(
                    "failed to send {cmd} after {MAX_ATTEMPTS} attempts: {e}"
                ));
            }
        }
    }
    false
}

// ===========================================================================
// Tests
// ===========================================================================
