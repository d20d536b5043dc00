//! Per-connection context consumed by forwarding strategies

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::proxy::connector::UpstreamStream;
use crate::proxy::request::HeaderList;

/// Deferred penalty handed to the controller along with a fallback
pub type Penalty = Box<dyn FnOnce() + Send + 'static>;

/// A strategy's request to abandon it for the current connection
pub struct Fallback {
    pub reason: String,
    penalty: Penalty,
}

impl Fallback {
    pub fn new(reason: impl Into<String>, penalty: Penalty) -> Self {
        Self {
            reason: reason.into(),
            penalty,
        }
    }

    /// Charge the failure to the strategy that requested the fallback
    pub fn apply_penalty(self) {
        (self.penalty)();
    }
}

impl std::fmt::Debug for Fallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fallback")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// The client side of one proxied connection
///
/// Carries the parsed request and the downstream socket. Strategies read and
/// adjust the request, write the upstream's response back, and either hand
/// the upstream over with [`forward`](ConnectionContext::forward) or signal
/// [`fall_back`](ConnectionContext::fall_back).
#[async_trait]
pub trait ConnectionContext: Send {
    /// Display identity used in logs
    fn peer(&self) -> &str;

    fn method(&self) -> &str;

    fn url(&self) -> &str;

    fn headers(&self) -> &HeaderList;

    fn headers_mut(&mut self) -> &mut HeaderList;

    /// Request body bytes received so far
    fn payload(&self) -> &[u8];

    fn forward_started(&self) -> bool;

    fn set_forward_started(&mut self);

    /// Finish parsing the inbound request; true iff the full payload arrived
    async fn recv_and_parse_request(&mut self) -> bool;

    /// Read the upstream's response head and whatever body is available
    async fn receive_upstream_response(&mut self, upstream: &mut UpstreamStream) -> Result<Bytes>;

    async fn write_downstream(&mut self, data: &[u8]) -> Result<()>;

    /// Abandon the current strategy for this connection
    fn fall_back(&mut self, reason: String, penalty: Penalty);

    /// Take the pending fallback, if any, for the controller to settle
    fn take_fallback(&mut self) -> Option<Fallback>;

    /// Pipe bytes between downstream and `upstream` until either side closes
    async fn forward(&mut self, upstream: UpstreamStream) -> Result<()>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fallback_penalty_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let fallback = Fallback::new(
            "connect timed out",
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );

        assert_eq!(fallback.reason, "connect timed out");
        assert!(format!("{:?}", fallback).contains("connect timed out"));

        fallback.apply_penalty();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
