//! Bidirectional byte pipe between two duplex streams with linked lifetimes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction before the pipe closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copies `a` → `b` and `b` → `a` until either side closes or errors, then
/// shuts both down. The two copy loops share one cancellation token: whichever
/// loop finishes first cancels the other.
pub async fn splice<A, B>(a: A, b: B) -> SpliceStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let cancel = CancellationToken::new();

    let (a_to_b, b_to_a) = tokio::join!(
        pump("a->b", a_read, b_write, cancel.clone()),
        pump("b->a", b_read, a_write, cancel.clone()),
    );
    SpliceStats { a_to_b, b_to_a }
}

async fn pump<R, W>(direction: &str, mut reader: R, mut writer: W, cancel: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("{} reached end of stream", direction);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("{} read error: {}", direction, e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            res = writer.write_all(&buf[..n]) => res,
        };
        if let Err(e) = written {
            debug!("{} write error: {}", direction, e);
            break;
        }
        total += n as u64;
    }

    cancel.cancel();
    let _ = writer.shutdown().await;
    total
}
