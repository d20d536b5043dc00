//! http-relay - HTTP relay forwarding for a fallback-chain proxy
//!
//! Forwards plain HTTP requests through fixed upstream HTTP proxies and falls
//! back to the next configured upstream when one cannot carry the request.
//!
//! ## Features
//!
//! - Timed upstream connect with optional TLS
//! - Request rewriting with `Connection: close` and Basic proxy credentials
//! - Deferred failure penalties settled by the fallback chain
//! - Optional SO_MARK tagging of in-flight request sockets on Linux

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{RelayError, Result};
