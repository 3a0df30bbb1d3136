//! Token lifecycle: claim parsing, on-disk persistence, and refresh
//!
//! The identity token is a three-segment dot-delimited signed structure
//! whose middle segment carries JSON claims; its `exp` claim is the sole
//! source of truth for refresh timing. Persistence is atomic per file so a
//! concurrent reader never observes a partial write.

pub mod claims;
pub mod refresh;
pub mod store;

pub use claims::expiry_unix;
pub use refresh::{RefreshClient, RefreshError};
pub use store::{CredentialSet, StoredTokens, TokenError, TokenStore};
