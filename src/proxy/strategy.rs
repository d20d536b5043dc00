//! Forwarding strategy interface
//!
//! Every way of delivering a client's request (HTTP relay, direct TCP,
//! SOCKS, ...) implements [`ForwardStrategy`]. The controller picks a
//! strategy per connection and moves on to the next one when it reports
//! [`ForwardOutcome::FallbackRequested`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{StrategyFlags, StrategyStats};
use crate::proxy::context::ConnectionContext;

/// Result of one forwarding attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The connection was handed to the duplex relay
    Forwarded,
    /// The strategy gave up; the context holds the pending fallback
    FallbackRequested(String),
}

/// A selectable way of forwarding a client connection
///
/// `Err` from [`do_forward`](ForwardStrategy::do_forward) is reserved for
/// failures no other strategy can recover from, such as a broken downstream.
#[async_trait]
pub trait ForwardStrategy: Send + Sync + std::fmt::Display {
    async fn do_forward(&self, ctx: &mut dyn ConnectionContext) -> Result<ForwardOutcome>;

    fn is_protocol_supported(&self, protocol: &str) -> bool;

    /// Operator-facing identity
    fn public_name(&self) -> String;

    /// Dead strategies must never be selected
    fn is_dead(&self) -> bool;

    fn priority(&self) -> i32;

    fn flags(&self) -> StrategyFlags;

    fn stats(&self) -> &StrategyStats;

    fn record_latency(&self, elapsed: Duration) {
        self.stats().record_latency(elapsed);
    }

    fn increase_failed_time(&self) {
        self.stats().increase_failed_time();
    }
}
