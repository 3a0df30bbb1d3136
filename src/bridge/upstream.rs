//! Upstream MQTT v5 session
//!
//! One client instance at a time, full stop. Credentials are supplied at
//! construction only; rotating them means tearing this session down and
//! spawning a fresh one, which also resets all TLS and protocol state. That
//! full reset is the only reliable way out of a stuck handshake.
//!
//! The event task is the signalling side of the capability split: it writes
//! the shared atomics, subscribes on a successful handshake, and republishes
//! telemetry through non-blocking local publishes. It never refreshes
//! tokens and never decides to rebuild; those calls come from the
//! supervisor.

use crate::bridge::local::LocalPublisher;
use crate::bridge::republish;
use crate::bridge::state::{
    connack_backoff_secs, now_unix, SessionState, TRANSPORT_BACKOFF_SECS,
};
use crate::config::BridgeConfig;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use rumqttc::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY_MIN: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(10);
const FENCE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The live upstream client and its event task.
pub struct UpstreamSession {
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Build the MQTT options for one upstream connection attempt.
///
/// Username is the account id, password the current identity token; TLS
/// uses the platform root store via the rustls default config.
fn upstream_options(config: &BridgeConfig, id_token: &str) -> MqttOptions {
    let mut options = MqttOptions::new(
        &config.client_id,
        &config.upstream_host,
        config.upstream_port,
    );
    options.set_transport(Transport::tls_with_default_config());
    options.set_credentials(&config.account_id, id_token);
    options.set_keep_alive(Duration::from_secs(30));
    options
}

impl UpstreamSession {
    /// Construct a fresh client from the current credentials and start its
    /// event task. The task gates its first poll, and therefore the
    /// CONNECT, on the backoff fence.
    pub fn spawn(
        config: &BridgeConfig,
        id_token: &str,
        state: Arc<SessionState>,
        local: LocalPublisher,
    ) -> Self {
        let options = upstream_options(config, id_token);
        let (client, event_loop) = AsyncClient::new(options, 64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            config.account_id.clone(),
            config.local_prefix.clone(),
            state,
            local,
            shutdown_rx,
        ));

        Self {
            client,
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Tear the session down: best-effort DISCONNECT, stop the event task,
    /// drop the client. Completes before any replacement is constructed.
    pub async fn shutdown(mut self) {
        let _ = self.client.try_disconnect();
        let _ = self.shutdown_tx.send(true);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                warn!("upstream event task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for UpstreamSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Map a poll error to its backoff fence, if the error class carries one.
///
/// A rejected CONNACK surfaces here as `ConnectionRefused`; TLS and socket
/// failures are the transport class. Protocol-state errors recover through
/// the internal reconnect delay alone.
fn poll_error_backoff(error: &ConnectionError) -> Option<i64> {
    match error {
        ConnectionError::ConnectionRefused(code) => Some(connack_backoff_secs(*code)),
        ConnectionError::Tls(_) | ConnectionError::Io(_) => Some(TRANSPORT_BACKOFF_SECS),
        _ => None,
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    account_id: String,
    prefix: String,
    state: Arc<SessionState>,
    local: LocalPublisher,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("upstream event loop starting");
    let mut reconnect_delay = RECONNECT_DELAY_MIN;

    if !wait_for_fence(&state, &mut shutdown_rx).await {
        return;
    }
    state.stamp_connect_attempt(now_unix());

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
                        info!(session_present = ack.session_present, "upstream connected");
                        state.set_connected(true);
                        state.clear_connect_attempt();
                        reconnect_delay = RECONNECT_DELAY_MIN;

                        let filter = format!("{account_id}/+");
                        if let Err(e) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                            error!(%filter, error = %e, "subscribe request failed");
                        }
                        local.publish_status(true);
                    } else {
                        // brokers that answer CONNACK before closing
                        warn!(code = ?ack.code, "upstream rejected connection");
                        state.apply_backoff(now_unix(), connack_backoff_secs(ack.code));
                        state.set_connected(false);
                        local.publish_status(false);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = String::from_utf8_lossy(&publish.topic).to_string();
                    handle_message(&prefix, &topic, &publish.payload, &local);
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    debug!(granted = ?suback.return_codes, "subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                    warn!(reason = ?disconnect.reason_code, "upstream sent DISCONNECT");
                    state.set_connected(false);
                    local.publish_status(false);
                }
                Ok(event) => {
                    debug!(target: "upstream_mqtt", ?event, "event");
                }
                Err(e) => {
                    warn!(error = %e, "upstream connection error");
                    state.set_connected(false);
                    local.publish_status(false);
                    if let Some(base) = poll_error_backoff(&e) {
                        state.apply_backoff(now_unix(), base);
                    }

                    // wait out the fence, then the internal reconnect delay;
                    // the next poll re-sends CONNECT
                    if !wait_for_fence(&state, &mut shutdown_rx).await {
                        break;
                    }
                    if !sleep_interruptible(reconnect_delay, &mut shutdown_rx).await {
                        break;
                    }
                    reconnect_delay = (reconnect_delay * 2).min(RECONNECT_DELAY_MAX);
                    state.stamp_connect_attempt(now_unix());
                }
            }
        }
    }
    info!("upstream event loop stopped");
}

/// Republish one delivered message: raw passthrough first, then the
/// per-property fan-out. Failures are logged and dropped; one bad message
/// must not kill the session.
fn handle_message(prefix: &str, topic: &str, payload: &[u8], local: &LocalPublisher) {
    let raw = republish::raw_topic(prefix, topic);
    debug!(in_topic = topic, out_topic = %raw, bytes = payload.len(), "forwarding raw");
    local.try_forward(&raw, payload.to_vec());

    match republish::fan_out(prefix, topic, payload) {
        Ok(publishes) => {
            for publish in publishes {
                debug!(out_topic = %publish.topic, "forwarding property");
                local.try_forward(&publish.topic, publish.payload);
            }
        }
        Err(reason) => {
            debug!(in_topic = topic, %reason, "skipping property fan-out");
        }
    }
}

/// Block until the backoff fence opens. Returns false on shutdown.
async fn wait_for_fence(state: &SessionState, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    loop {
        if state.fence_open(now_unix()) {
            return true;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return false;
                }
            }
            _ = tokio::time::sleep(FENCE_POLL_INTERVAL) => {}
        }
    }
}

/// Sleep that aborts early on shutdown. Returns false on shutdown.
async fn sleep_interruptible(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(delay) => true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_error_backoff_refused_uses_table() {
        let quota = ConnectionError::ConnectionRefused(ConnectReturnCode::QuotaExceeded);
        assert_eq!(poll_error_backoff(&quota), Some(60));

        let auth = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(poll_error_backoff(&auth), Some(30));

        let busy = ConnectionError::ConnectionRefused(ConnectReturnCode::ServerUnavailable);
        assert_eq!(poll_error_backoff(&busy), Some(5));
    }

    #[test]
    fn test_poll_error_backoff_transport() {
        let eof = ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "unexpected eof",
        ));
        assert_eq!(poll_error_backoff(&eof), Some(TRANSPORT_BACKOFF_SECS));
    }

    #[tokio::test]
    async fn test_wait_for_fence_passes_when_open() {
        let state = SessionState::new(0);
        let (_tx, mut rx) = watch::channel(false);
        assert!(wait_for_fence(&state, &mut rx).await);
    }

    #[tokio::test]
    async fn test_wait_for_fence_aborts_on_shutdown() {
        let state = SessionState::new(0);
        state.apply_backoff(now_unix(), 3600);
        let (tx, mut rx) = watch::channel(false);

        let shutdown = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
            tx
        });

        assert!(!wait_for_fence(&state, &mut rx).await);
        let _tx = shutdown.await.unwrap();
    }

    #[tokio::test]
    async fn test_sleep_interruptible_completes() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep_interruptible(Duration::from_millis(5), &mut rx).await);
    }

    #[tokio::test]
    async fn test_sleep_interruptible_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
            // keep the sender alive long enough for the receiver to observe
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        assert!(!sleep_interruptible(Duration::from_secs(5), &mut rx).await);
    }

    #[test]
    fn test_upstream_options_carry_credentials() {
        let config = BridgeConfig {
            client_id: "a81c3090-7f10-4b2a-9cde-1f64b1a0c001".to_string(),
            account_id: "b92d41a1-8e21-4c3b-8def-2a75c2b1d002".to_string(),
            upstream_host: "example.invalid".to_string(),
            upstream_port: 9000,
            local_host: "127.0.0.1".to_string(),
            local_port: 1883,
            local_prefix: "bmw/".to_string(),
            local_user: None,
            local_password: None,
            state_dir: std::path::PathBuf::from("/tmp"),
        };
        let options = upstream_options(&config, "h.c.s");
        assert_eq!(options.broker_address(), ("example.invalid".to_string(), 9000));
    }
}
