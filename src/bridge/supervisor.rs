//! The supervisor: refresh timing, CONNECT watchdog, shutdown
//!
//! The supervisor is the single owner of timing decisions. It polls the
//! clock once a second, observes the atomics written by the event tasks,
//! and is the only caller of the refresh client and the only initiator of
//! session rebuilds. Everything it does is gated by the backoff fence.

use crate::bridge::local::{LocalLoop, LocalPublisher};
use crate::bridge::state::{now_unix, SessionState, REFRESH_FAILURE_BACKOFF_SECS};
use crate::bridge::upstream::UpstreamSession;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::token::{expiry_unix, CredentialSet, RefreshClient, TokenStore};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tracing::{info, warn};

/// Refresh this long before token expiry.
pub const SOFT_MARGIN_SECS: i64 = 600;
/// Safety margin against clock drift between us and the vendor.
pub const CLOCK_SKEW_SECS: i64 = 60;
/// Refresh at least this often regardless of the claimed expiry.
pub const HARD_INTERVAL_SECS: i64 = 2700;
/// Minimum spacing between refresh attempts.
pub const REFRESH_ATTEMPT_SPACING_SECS: i64 = 10;
/// A CONNECT with no terminal answer for this long counts as hung.
pub const CONNECT_TIMEOUT_SECS: i64 = 30;

const TICK: Duration = Duration::from_secs(1);

/// Why a refresh fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    /// Token expiry is inside the soft margin
    Soft,
    /// Wall-clock interval since the last success elapsed
    Hard,
}

impl fmt::Display for RefreshKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshKind::Soft => write!(f, "soft"),
            RefreshKind::Hard => write!(f, "hard"),
        }
    }
}

/// Is a refresh due? (pure function)
pub fn refresh_due(id_token_exp: i64, now: i64, last_successful: i64) -> Option<RefreshKind> {
    if id_token_exp - now <= SOFT_MARGIN_SECS + CLOCK_SKEW_SECS {
        return Some(RefreshKind::Soft);
    }
    if now - last_successful >= HARD_INTERVAL_SECS {
        return Some(RefreshKind::Hard);
    }
    None
}

/// Has the in-flight CONNECT exceeded the watchdog timeout? (pure function)
pub fn connect_hung(last_connect_attempt: i64, now: i64) -> bool {
    last_connect_attempt != 0 && now - last_connect_attempt > CONNECT_TIMEOUT_SECS
}

/// The bridge supervisor and everything it owns.
pub struct Supervisor {
    config: BridgeConfig,
    state: Arc<SessionState>,
    store: TokenStore,
    refresher: RefreshClient,
    credentials: CredentialSet,
    local: LocalPublisher,
    local_loop: LocalLoop,
    session: Option<UpstreamSession>,
    last_refresh_attempt: i64,
    last_successful_refresh: i64,
}

impl Supervisor {
    /// Boot the bridge: load credentials, validate the identity token
    /// (attempting one refresh if its expiry is unreadable), connect the
    /// local broker, prime the status topic, and spawn the first upstream
    /// session.
    pub async fn bootstrap(config: BridgeConfig) -> BridgeResult<Self> {
        let store = TokenStore::new(&config.state_dir);
        let stored = store.load()?;
        let refresher = RefreshClient::new(&config.client_id)?;

        let mut credentials = CredentialSet {
            id_token: stored.id_token,
            refresh_token: stored.refresh_token,
            access_token: String::new(),
        };

        let mut exp = expiry_unix(&credentials.id_token);
        if exp == 0 {
            warn!("stored identity token has no usable expiry, attempting refresh");
            let set = refresher
                .refresh(&store, &credentials.refresh_token)
                .await
                .map_err(|e| BridgeError::NoUsableToken(e.to_string()))?;
            exp = expiry_unix(&set.id_token);
            if exp == 0 {
                return Err(BridgeError::NoUsableToken(
                    "refreshed identity token carries no expiry".to_string(),
                ));
            }
            credentials = set;
        }
        info!(exp, in_secs = exp - now_unix(), "identity token loaded");

        let state = Arc::new(SessionState::new(exp));
        let (local, local_loop) = LocalPublisher::connect(&config).await?;
        local.publish_status(false);

        let session =
            UpstreamSession::spawn(&config, &credentials.id_token, state.clone(), local.clone());

        Ok(Self {
            config,
            state,
            store,
            refresher,
            credentials,
            local,
            local_loop,
            session: Some(session),
            last_refresh_attempt: 0,
            last_successful_refresh: now_unix(),
        })
    }

    /// Run the tick loop until SIGINT/SIGTERM.
    pub async fn run(mut self) -> BridgeResult<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        info!("bridge running");
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sleep(TICK) => {}
            }

            let now = now_unix();

            // G0: no action of any kind while the backoff fence is closed
            if !self.state.fence_open(now) {
                continue;
            }

            // G1: token refresh
            self.maybe_refresh(now).await;

            // a failed refresh raises the fence; re-check before the watchdog
            let now = now_unix();
            if !self.state.fence_open(now) {
                continue;
            }

            // G2: CONNECT watchdog
            self.maybe_rebuild_hung_connect(now).await;
        }

        self.teardown().await;
        Ok(())
    }

    async fn maybe_refresh(&mut self, now: i64) {
        let Some(kind) = refresh_due(
            self.state.id_token_exp(),
            now,
            self.last_successful_refresh,
        ) else {
            return;
        };
        if now - self.last_refresh_attempt <= REFRESH_ATTEMPT_SPACING_SECS {
            return;
        }

        // stagger across fleet restarts
        let stagger: u64 = rand::thread_rng().gen_range(100..=300);
        sleep(Duration::from_millis(stagger)).await;

        info!(%kind, "token refresh");
        self.last_refresh_attempt = now;

        // re-read from disk: an external flow may have rotated the
        // credential since the last refresh
        let refresh_token = match self.store.load_refresh_token() {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "cannot read refresh credential");
                self.state
                    .apply_backoff(now_unix(), REFRESH_FAILURE_BACKOFF_SECS);
                return;
            }
        };

        match self.refresher.refresh(&self.store, &refresh_token).await {
            Ok(set) => {
                self.last_successful_refresh = now;
                self.state.set_id_token_exp(expiry_unix(&set.id_token));
                self.credentials = set;

                // rotate: never hand a new password to a live connection.
                // Drop connected, let the old session drain, then rebuild
                // with the new credentials.
                self.state.set_connected(false);
                self.local.publish_status(false);
                let drain: u64 = rand::thread_rng().gen_range(1500..=2000);
                sleep(Duration::from_millis(drain)).await;
                self.rebuild().await;
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, retrying shortly");
                self.state
                    .apply_backoff(now_unix(), REFRESH_FAILURE_BACKOFF_SECS);
            }
        }
    }

    async fn maybe_rebuild_hung_connect(&mut self, now: i64) {
        if !connect_hung(self.state.last_connect_attempt(), now) {
            return;
        }
        warn!(
            timeout_secs = CONNECT_TIMEOUT_SECS,
            "CONNECT timed out or handshake failed, rebuilding upstream client"
        );
        self.state.set_connected(false);
        self.local.publish_status(false);
        self.rebuild().await;
    }

    /// Full teardown of the old upstream client before constructing the new
    /// one; the replacement's event task re-gates on the backoff fence and
    /// stamps the connect attempt itself.
    async fn rebuild(&mut self) {
        if let Some(old) = self.session.take() {
            old.shutdown().await;
        }
        self.state.clear_connect_attempt();
        let session = UpstreamSession::spawn(
            &self.config,
            &self.credentials.id_token,
            self.state.clone(),
            self.local.clone(),
        );
        self.session = Some(session);
    }

    async fn teardown(mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown().await;
        }
        // dropping the local loop without DISCONNECT lets the broker fire
        // the retained last will
        self.local_loop.shutdown().await;
        info!("bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_due_soft_boundary() {
        let now = 1_000_000;
        // exactly at soft margin + skew
        assert_eq!(
            refresh_due(now + SOFT_MARGIN_SECS + CLOCK_SKEW_SECS, now, now),
            Some(RefreshKind::Soft)
        );
        // one second outside the margin, hard interval not yet reached
        assert_eq!(
            refresh_due(now + SOFT_MARGIN_SECS + CLOCK_SKEW_SECS + 1, now, now),
            None
        );
    }

    #[test]
    fn test_refresh_due_expired_token() {
        let now = 1_000_000;
        assert_eq!(refresh_due(0, now, now), Some(RefreshKind::Soft));
        assert_eq!(refresh_due(now - 100, now, now), Some(RefreshKind::Soft));
    }

    #[test]
    fn test_refresh_due_hard_interval() {
        let now = 1_000_000;
        let far_exp = now + 7200;
        assert_eq!(refresh_due(far_exp, now, now - HARD_INTERVAL_SECS + 1), None);
        assert_eq!(
            refresh_due(far_exp, now, now - HARD_INTERVAL_SECS),
            Some(RefreshKind::Hard)
        );
    }

    #[test]
    fn test_soft_takes_precedence_over_hard() {
        let now = 1_000_000;
        assert_eq!(
            refresh_due(now + 100, now, now - HARD_INTERVAL_SECS - 100),
            Some(RefreshKind::Soft)
        );
    }

    #[test]
    fn test_connect_hung() {
        let now = 1_000_000;
        // no CONNECT in flight
        assert!(!connect_hung(0, now));
        // within the timeout, boundary inclusive
        assert!(!connect_hung(now - CONNECT_TIMEOUT_SECS, now));
        // past the timeout
        assert!(connect_hung(now - CONNECT_TIMEOUT_SECS - 1, now));
    }

    #[test]
    fn test_refresh_kind_display() {
        assert_eq!(RefreshKind::Soft.to_string(), "soft");
        assert_eq!(RefreshKind::Hard.to_string(), "hard");
    }
}
