//! Registry credential lifecycle.
//!
//! Fetches ECR authorization tokens, keeps the current one behind a
//! read-mostly lock, and refreshes it lazily on read or on a fixed schedule.

pub mod ecr;
pub mod manager;
pub mod refresher;
pub mod source;

pub use manager::{Credential, CredentialManager, RefreshError};
pub use source::{AuthorizationRecord, AuthorizationSource, FetchError};
