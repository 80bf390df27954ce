//! Shared ambient stack used by every protocol crate: configuration loading,
//! the Credential Verifier, the TLS Terminator, the Connection Supervisor,
//! logging initialization, and the error-kind taxonomy each protocol crate's
//! `SessionError` maps onto.

pub mod auth;
pub mod config;
pub mod error;
pub mod listener;
pub mod telemetry;
pub mod tls;
