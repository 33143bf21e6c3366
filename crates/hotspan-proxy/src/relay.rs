//! Counted bidirectional relay.
//!
//! Copies bytes between the client and upstream sockets until both
//! directions finish, an I/O error occurs, or shutdown is signalled. The two
//! directions terminate independently: one side closing its write half only
//! shuts down the matching upstream direction. Counters live in atomics so a
//! forced shutdown still yields accurate totals.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// How a relay ended.
#[derive(Debug)]
pub(crate) enum RelayEnd {
    /// Both directions reached EOF.
    Completed,
    /// One direction failed with an I/O error.
    Failed(std::io::Error),
    /// Shutdown was signalled mid-relay.
    Cancelled,
}

/// Totals for one finished relay, in both directions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelayTotals {
    /// Bytes the client pushed toward the internet.
    pub client_to_upstream: u64,
    /// Bytes the internet pushed back toward the client.
    pub upstream_to_client: u64,
}

/// Copies one direction, counting every byte, and half-closes the writer at
/// EOF.
async fn pump<R, W>(mut reader: R, mut writer: W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

/// Relays bytes between `client` and `upstream` until both directions
/// complete, either fails, or `shutdown` fires.
pub(crate) async fn relay<C, U>(
    client: C,
    upstream: U,
    shutdown: &mut broadcast::Receiver<()>,
) -> (RelayTotals, RelayEnd)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let client_to_upstream = AtomicU64::new(0);
    let upstream_to_client = AtomicU64::new(0);

    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let transfer = async {
        let (up, down) = tokio::join!(
            pump(client_read, upstream_write, &client_to_upstream),
            pump(upstream_read, client_write, &upstream_to_client),
        );
        up.and(down)
    };
    tokio::pin!(transfer);

    let end = tokio::select! {
        result = &mut transfer => match result {
            Ok(()) => RelayEnd::Completed,
            Err(e) => RelayEnd::Failed(e),
        },
        _ = shutdown.recv() => RelayEnd::Cancelled,
    };

    let totals = RelayTotals {
        client_to_upstream: client_to_upstream.load(Ordering::Relaxed),
        upstream_to_client: upstream_to_client.load(Ordering::Relaxed),
    };
    (totals, end)
}
