//! Shared session state and backoff policy
//!
//! One owned value holds every field the three tasks coordinate through,
//! handed around as `Arc<SessionState>`. All accesses are relaxed: the
//! clocks are seconds-granularity and the ordering requirements are
//! best-effort by design.

use rand::Rng;
use rumqttc::v5::mqttbytes::v5::ConnectReturnCode;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Backoff after a transport-level failure (TLS error, unexpected EOF, I/O).
pub const TRANSPORT_BACKOFF_SECS: i64 = 5;
/// Local fence after a failed refresh attempt, to avoid hammering the
/// endpoint from the 1 s tick loop.
pub const REFRESH_FAILURE_BACKOFF_SECS: i64 = 15;

/// Current wall-clock time in Unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Coordination state shared between the supervisor and the event tasks.
///
/// Single writer per field: `connected` and `last_connect_attempt` are
/// written by the upstream event task (and reset around rebuilds by the
/// supervisor); `next_connect_after` is written by whichever task observed
/// the failure; `id_token_exp` only by the supervisor.
#[derive(Debug)]
pub struct SessionState {
    connected: AtomicBool,
    /// Unix seconds of the in-flight CONNECT; 0 = none outstanding
    last_connect_attempt: AtomicI64,
    /// Backoff fence: no connect/reconnect/rebuild before this instant
    next_connect_after: AtomicI64,
    /// `exp` claim of the identity token currently used as password
    id_token_exp: AtomicI64,
}

impl SessionState {
    pub fn new(id_token_exp: i64) -> Self {
        Self {
            connected: AtomicBool::new(false),
            last_connect_attempt: AtomicI64::new(0),
            next_connect_after: AtomicI64::new(0),
            id_token_exp: AtomicI64::new(id_token_exp),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn last_connect_attempt(&self) -> i64 {
        self.last_connect_attempt.load(Ordering::Relaxed)
    }

    /// Record that a CONNECT is about to go out.
    pub fn stamp_connect_attempt(&self, now: i64) {
        self.last_connect_attempt.store(now, Ordering::Relaxed);
    }

    /// Clear the in-flight CONNECT marker (handshake completed).
    pub fn clear_connect_attempt(&self) {
        self.last_connect_attempt.store(0, Ordering::Relaxed);
    }

    pub fn next_connect_after(&self) -> i64 {
        self.next_connect_after.load(Ordering::Relaxed)
    }

    /// True when the backoff fence permits network-initiating actions.
    pub fn fence_open(&self, now: i64) -> bool {
        now >= self.next_connect_after()
    }

    /// Raise the backoff fence to `now + base + jitter`.
    pub fn apply_backoff(&self, now: i64, base_secs: i64) {
        self.next_connect_after
            .store(now + jittered_secs(base_secs), Ordering::Relaxed);
    }

    pub fn id_token_exp(&self) -> i64 {
        self.id_token_exp.load(Ordering::Relaxed)
    }

    pub fn set_id_token_exp(&self, exp: i64) {
        self.id_token_exp.store(exp, Ordering::Relaxed);
    }
}

/// Backoff table for CONNACK rejections, in seconds.
///
/// Quota rejections are the expensive case upstream, so they get the
/// longest fence; authorization failures wait for the next token refresh
/// window; everything else retries quickly.
pub fn connack_backoff_secs(code: ConnectReturnCode) -> i64 {
    match code {
        ConnectReturnCode::QuotaExceeded => 60,
        ConnectReturnCode::NotAuthorized => 30,
        ConnectReturnCode::UnspecifiedError | ConnectReturnCode::ClientIdentifierNotValid => 20,
        _ => 5,
    }
}

/// Perturb a base delay with uniform jitter in [-250, +250] ms, quantised
/// to whole seconds, so restarts across a fleet do not retry in lockstep.
pub fn jittered_secs(base_secs: i64) -> i64 {
    let jitter_ms: i64 = rand::thread_rng().gen_range(-250..=250);
    base_secs + jitter_ms / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = SessionState::new(1764003600);
        assert!(!state.is_connected());
        assert_eq!(state.last_connect_attempt(), 0);
        assert_eq!(state.next_connect_after(), 0);
        assert_eq!(state.id_token_exp(), 1764003600);
        assert!(state.fence_open(0));
    }

    #[test]
    fn test_fence_blocks_until_deadline() {
        let state = SessionState::new(0);
        state.apply_backoff(1000, 60);

        // jitter quantisation keeps the fence within one second of base
        let fence = state.next_connect_after();
        assert!((1059..=1061).contains(&fence), "fence = {fence}");
        assert!(!state.fence_open(fence - 1));
        assert!(state.fence_open(fence));
    }

    #[test]
    fn test_connect_attempt_stamping() {
        let state = SessionState::new(0);
        state.stamp_connect_attempt(5000);
        assert_eq!(state.last_connect_attempt(), 5000);
        state.clear_connect_attempt();
        assert_eq!(state.last_connect_attempt(), 0);
    }

    #[test]
    fn test_connack_backoff_table() {
        assert_eq!(connack_backoff_secs(ConnectReturnCode::QuotaExceeded), 60);
        assert_eq!(connack_backoff_secs(ConnectReturnCode::NotAuthorized), 30);
        assert_eq!(connack_backoff_secs(ConnectReturnCode::UnspecifiedError), 20);
        assert_eq!(
            connack_backoff_secs(ConnectReturnCode::ClientIdentifierNotValid),
            20
        );
        assert_eq!(connack_backoff_secs(ConnectReturnCode::ServerUnavailable), 5);
        assert_eq!(connack_backoff_secs(ConnectReturnCode::BadUserNamePassword), 5);
    }

    #[test]
    fn test_jitter_stays_within_one_second() {
        for _ in 0..200 {
            let delay = jittered_secs(20);
            assert!((19..=21).contains(&delay), "delay = {delay}");
        }
    }
}
