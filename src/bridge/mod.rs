//! The bridge core: session state, republication, and supervision
//!
//! Three concurrent activities share the session state: the supervisor task
//! (sole initiator of refreshes and rebuilds), the upstream event task, and
//! the local event task. Event tasks may only signal, through atomic writes
//! and non-blocking publishes; every timing decision belongs to the
//! supervisor.
//!
//! - [`state`]: shared atomics, the backoff table, jitter
//! - [`republish`]: pure topic rewriting and per-property fan-out
//! - [`local`]: local-broker client (status topic, last will)
//! - [`upstream`]: upstream MQTT v5 session and its event task
//! - [`supervisor`]: the tick loop with refresh timing, watchdog, shutdown

pub mod local;
pub mod republish;
pub mod state;
pub mod supervisor;
pub mod upstream;

pub use local::LocalPublisher;
pub use state::SessionState;
pub use supervisor::Supervisor;
pub use upstream::UpstreamSession;
