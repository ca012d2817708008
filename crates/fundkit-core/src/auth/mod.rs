//! Authentication module for admin sessions and credentials.
//!
//! This module provides:
//! - `Session`: token-based session persisted to disk, refreshed before expiry
//! - `CredentialStore`: OS keychain storage for the admin password
//!
//! `Session` also serves as the service's `AuthProvider`, so the signed-in
//! user stamps ownership on created kits and fundraisers.

pub mod credentials;
pub mod session;

pub use credentials::CredentialStore;
pub use session::{Session, SessionData};
