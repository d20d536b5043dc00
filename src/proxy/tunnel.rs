//! Duplex byte relay
//!
//! Pipes bytes between the downstream client and the upstream connection
//! once a strategy has committed to it. No protocol awareness.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::proxy::connector::UpstreamStream;

/// Copy one direction until EOF or error, then half-close the writer
async fn pipe<R, W>(mut from: ReadHalf<R>, mut to: WriteHalf<W>, direction: &'static str) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let copied = match tokio::io::copy(&mut from, &mut to).await {
        Ok(n) => n,
        Err(e) => {
            debug!(direction, error = %e, "Relay direction aborted");
            0
        }
    };
    if let Err(e) = to.shutdown().await {
        debug!(direction, error = %e, "Half-close failed");
    }
    copied
}

/// Relay both directions between `client` and `server` until each side has
/// reached EOF
///
/// Returns `(client_to_server, server_to_client)` byte counts. A failing
/// direction counts as zero bytes and does not abort the other one.
#[instrument(skip(client, server))]
pub async fn copy_bidirectional<C, S>(client: C, server: S) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_rx, client_tx) = tokio::io::split(client);
    let (server_rx, server_tx) = tokio::io::split(server);

    let (upstream_bytes, downstream_bytes) = tokio::join!(
        pipe(client_rx, server_tx, "client->upstream"),
        pipe(server_rx, client_tx, "upstream->client"),
    );

    debug!(upstream_bytes, downstream_bytes, "Relay closed");
    Ok((upstream_bytes, downstream_bytes))
}

/// Relay between a downstream client and an upstream connection, charging
/// the transferred bytes to the upstream's counter
pub async fn relay_upstream<C>(client: C, upstream: UpstreamStream) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let counter = upstream.counter();
    let (sent, received) = copy_bidirectional(client, upstream).await?;
    counter.sending(sent as usize);
    counter.received(received as usize);
    Ok((sent, received))
}
