//! Access-credential acquisition for voxlink sessions.
//!
//! A [`CredentialProvider`] fetches short-lived participant tokens from a
//! [`CredentialSource`] (normally the HTTP token endpoint), retries
//! transient failures with jittered backoff, caches the result, and renews
//! it in the background shortly before it expires.

pub mod config;
pub mod error;
pub mod provider;
pub mod source;

pub use config::CredentialSettings;
pub use error::CredentialError;
pub use provider::CredentialProvider;
pub use source::{CredentialOptions, CredentialSource, HttpCredentialSource, StaticCredentialSource};
