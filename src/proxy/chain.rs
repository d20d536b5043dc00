//! In-order fallback driver
//!
//! Tries each live strategy that supports the connection's protocol until one
//! forwards it. Penalties from strategies that fell back are deferred: they
//! are only charged once a later strategy succeeds, so a client whose whole
//! network is down does not demote every strategy at once.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{RelayError, Result};
use crate::proxy::context::{ConnectionContext, Fallback};
use crate::proxy::strategy::{ForwardOutcome, ForwardStrategy};

/// Ordered list of forwarding strategies
pub struct StrategyChain {
    strategies: Vec<Arc<dyn ForwardStrategy>>,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Arc<dyn ForwardStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Strategies eligible for `protocol`, in configured order
    pub fn candidates(&self, protocol: &str) -> Vec<Arc<dyn ForwardStrategy>> {
        self.strategies
            .iter()
            .filter(|s| !s.is_dead() && s.is_protocol_supported(protocol))
            .cloned()
            .collect()
    }

    /// Operator-facing listing of every strategy
    pub fn public_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.public_name()).collect()
    }

    /// Forward `ctx` through the first strategy that accepts it
    #[instrument(skip(self, ctx), fields(peer = %ctx.peer()))]
    pub async fn forward(
        &self,
        ctx: &mut dyn ConnectionContext,
        protocol: &str,
    ) -> Result<Arc<dyn ForwardStrategy>> {
        let candidates = self.candidates(protocol);
        if candidates.is_empty() {
            return Err(RelayError::UnsupportedProtocol(protocol.to_string()));
        }

        let mut attempts = 0u32;
        let mut deferred: Vec<Fallback> = Vec::new();

        for strategy in candidates {
            attempts += 1;
            debug!("Trying {} (attempt {})", strategy, attempts);

            match strategy.do_forward(ctx).await {
                Ok(ForwardOutcome::Forwarded) => {
                    info!("[{}] forwarded via {}", ctx.peer(), strategy);
                    for fallback in deferred {
                        fallback.apply_penalty();
                    }
                    return Ok(strategy);
                }
                Ok(ForwardOutcome::FallbackRequested(reason)) => {
                    warn!("[{}] fall back from {}: {}", ctx.peer(), strategy, reason);
                    if let Some(fallback) = ctx.take_fallback() {
                        deferred.push(fallback);
                    }
                }
                Err(e) => {
                    warn!("[{}] {} failed: {}", ctx.peer(), strategy, e);
                    if let Some(fallback) = ctx.take_fallback() {
                        deferred.push(fallback);
                    }
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                }
            }

            if ctx.forward_started() {
                // Response bytes already reached the client; retrying would corrupt the stream.
                return Err(RelayError::AllStrategiesExhausted { attempts });
            }
        }

        Err(RelayError::AllStrategiesExhausted { attempts })
    }
}
