//! Local broker client
//!
//! A second MQTT client against the locally operated broker. It carries the
//! retained status topic and its last will, and forwards telemetry with
//! non-blocking publishes so the upstream event task never stalls on it.

use crate::bridge::state::now_unix;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, LastWill, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LOCAL_CLIENT_ID: &str = "cardata-local-forwarder";
const CONNECT_WAIT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY_MIN: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(10);

/// Link state reported by the local event task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Up,
    Refused(String),
}

/// Publish handle for the local broker. Cheap to clone; shared with the
/// upstream event task for message forwarding and status publishes.
#[derive(Clone)]
pub struct LocalPublisher {
    client: AsyncClient,
    status_topic: Arc<str>,
}

/// Owner of the local event-loop task; held by the supervisor for teardown.
pub struct LocalLoop {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Status payload for the retained status topic (pure function).
pub fn status_payload(connected: bool, timestamp: i64) -> String {
    serde_json::json!({ "connected": connected, "timestamp": timestamp }).to_string()
}

impl LocalPublisher {
    /// Connect to the local broker and start its event loop. Fails when no
    /// CONNACK (or a refusal) arrives within the boot window; the bridge
    /// is useless without a local broker, so this is a startup error.
    pub async fn connect(config: &BridgeConfig) -> BridgeResult<(Self, LocalLoop)> {
        let status_topic = config.status_topic();

        let mut options =
            MqttOptions::new(LOCAL_CLIENT_ID, &config.local_host, config.local_port);
        options.set_keep_alive(Duration::from_secs(30));
        // the broker republishes this retained on any unclean disconnect
        let lwt = LastWill::new(
            &status_topic,
            serde_json::json!({ "connected": false }).to_string(),
            QoS::AtMostOnce,
            true,
            None,
        );
        options.set_last_will(lwt);
        if let (Some(user), Some(password)) = (&config.local_user, &config.local_password) {
            options.set_credentials(user, password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (state_tx, mut state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut delay = RECONNECT_DELAY_MIN;
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    polled = event_loop.poll() => match polled {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            if ack.code == ConnectReturnCode::Success {
                                info!("local broker connected");
                                delay = RECONNECT_DELAY_MIN;
                                let _ = state_tx.send(LinkState::Up);
                            } else {
                                error!(code = ?ack.code, "local broker refused connection");
                                let _ = state_tx.send(LinkState::Refused(format!("{:?}", ack.code)));
                            }
                        }
                        Ok(event) => {
                            debug!(target: "local_mqtt", ?event, "event");
                        }
                        Err(e) => {
                            warn!(error = %e, "local broker connection error, retrying");
                            tokio::select! {
                                changed = shutdown_rx.changed() => {
                                    if changed.is_err() || *shutdown_rx.borrow() {
                                        break;
                                    }
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                            delay = (delay * 2).min(RECONNECT_DELAY_MAX);
                        }
                    }
                }
            }
            debug!("local event loop stopped");
        });

        let publisher = Self {
            client,
            status_topic: status_topic.into(),
        };
        let local_loop = LocalLoop {
            shutdown_tx,
            task: Some(task),
        };

        // gate startup on the first CONNACK
        let wait = tokio::time::timeout(CONNECT_WAIT, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err("local event loop ended".to_string());
                }
                match &*state_rx.borrow() {
                    LinkState::Up => return Ok(()),
                    LinkState::Refused(reason) => return Err(reason.clone()),
                    LinkState::Connecting => continue,
                }
            }
        })
        .await;

        match wait {
            Ok(Ok(())) => Ok((publisher, local_loop)),
            Ok(Err(reason)) => Err(BridgeError::LocalConnect(reason)),
            Err(_) => Err(BridgeError::LocalConnect(format!(
                "no CONNACK from {}:{} within {:?}",
                config.local_host, config.local_port, CONNECT_WAIT
            ))),
        }
    }

    /// Publish the retained connection status. Non-blocking; a full request
    /// queue is logged and dropped rather than stalling the caller.
    pub fn publish_status(&self, connected: bool) {
        let payload = status_payload(connected, now_unix());
        if let Err(e) = self.client.try_publish(
            self.status_topic.as_ref(),
            QoS::AtMostOnce,
            true,
            payload,
        ) {
            warn!(error = %e, "status publish dropped");
        }
    }

    /// Forward one telemetry payload, QoS 0, not retained. Non-blocking.
    pub fn try_forward(&self, topic: &str, payload: Vec<u8>) {
        if let Err(e) = self.client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            warn!(topic, error = %e, "forward publish dropped");
        }
    }
}

impl LocalLoop {
    /// Stop the local event loop without sending DISCONNECT: the broker
    /// notices the dead connection and publishes the retained last will.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}

impl Drop for LocalLoop {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_payload_shape() {
        let payload = status_payload(true, 1764003600);
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["connected"], true);
        assert_eq!(json["timestamp"], 1764003600);
    }

    #[test]
    fn test_status_payload_disconnected() {
        let payload = status_payload(false, 0);
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["connected"], false);
    }
}
