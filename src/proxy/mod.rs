//! Relay proxy implementation
//!
//! This module provides:
//! - The forwarding strategy interface and the HTTP relay strategy
//! - Upstream dialing with optional TLS and socket marking
//! - The per-connection client context and duplex relay
//! - The in-order fallback chain and the listener in front of it

pub mod chain;
pub mod client;
pub mod connector;
pub mod context;
pub mod relay;
pub mod request;
pub mod server;
pub mod strategy;
pub mod tunnel;

pub use chain::StrategyChain;
pub use client::ClientConnection;
pub use connector::{ByteCounter, UpstreamConnector, UpstreamStream};
pub use context::{ConnectionContext, Fallback, Penalty};
pub use relay::HttpRelayProxy;
pub use request::{HeaderList, RequestBuilder};
pub use server::RelayServer;
pub use strategy::{ForwardOutcome, ForwardStrategy};
