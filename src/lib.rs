//! cardata-bridge
//!
//! Bridges a vendor-hosted vehicle-telemetry MQTT v5 stream to a locally
//! operated broker. The upstream broker authenticates with a short-lived
//! signed identity token carried as the MQTT password; this crate owns the
//! full token-refresh lifecycle, reconnect orchestration, and backoff
//! discipline needed to keep the stream flowing indefinitely.
//!
//! # Architecture
//!
//! - [`token`]: credential parsing, atomic on-disk persistence, and the
//!   OAuth refresh exchange
//! - [`bridge`]: the session core with shared state and backoff policy, the
//!   upstream MQTT session, the local republisher, and the supervisor loop
//!   that drives refresh timing, the connect watchdog, and shutdown
//! - [`config`]: environment/.env configuration
//! - [`observability`]: structured logging setup
//!
//! Every delivered upstream message is republished twice over: once raw
//! under `<prefix>raw/<vehicle-id>/...` and once per telemetry property
//! under `<prefix>vehicles/<vehicle-id>/<property>`. A retained
//! `<prefix>status` topic (with matching last will) tracks upstream
//! connectivity.

pub mod bridge;
pub mod config;
pub mod error;
pub mod observability;
pub mod token;

pub use bridge::{LocalPublisher, SessionState, Supervisor, UpstreamSession};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use token::{CredentialSet, RefreshClient, TokenStore};
