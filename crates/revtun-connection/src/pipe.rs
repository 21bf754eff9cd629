//! Bidirectional pipe between two duplex endpoints

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument, Span};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes copied in each direction by a finished [`pipe`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl PipeStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Copy bytes between `a` and `b` in both directions until either side ends
///
/// Both directions run as their own task. When one direction sees
/// end-of-stream or an error it shuts down its writer and stops the other
/// direction, so a peer stuck on one side is released when the other side
/// finishes. Returns once both tasks are done; both endpoints are dropped by
/// then. I/O errors are logged, never returned.
///
/// The tasks run inside the caller's current span.
pub async fn pipe<A, B>(a: A, b: B) -> PipeStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let done = CancellationToken::new();

    let forward = tokio::spawn(
        copy_until_done(a_read, b_write, done.clone(), "a->b").instrument(Span::current()),
    );
    let backward = tokio::spawn(
        copy_until_done(b_read, a_write, done.clone(), "b->a").instrument(Span::current()),
    );

    let (forward, backward) = tokio::join!(forward, backward);

    let stats = PipeStats {
        a_to_b: forward.unwrap_or_else(|e| {
            warn!("Pipe task a->b failed: {}", e);
            0
        }),
        b_to_a: backward.unwrap_or_else(|e| {
            warn!("Pipe task b->a failed: {}", e);
            0
        }),
    };

    trace!(a_to_b = stats.a_to_b, b_to_a = stats.b_to_a, "Pipe finished");
    stats
}

async fn copy_until_done<R, W>(
    mut reader: R,
    mut writer: W,
    done: CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            _ = done.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(direction, "Read failed: {}", e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = done.cancelled() => break,
            result = writer.write_all(&buf[..n]) => result,
        };
        if let Err(e) = written {
            debug!(direction, "Write failed: {}", e);
            break;
        }

        copied += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        trace!(direction, "Shutdown failed: {}", e);
    }
    done.cancel();

    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_pipe_copies_both_ways() {
        let (mut left, a) = duplex(1024);
        let (b, mut right) = duplex(1024);

        let handle = tokio::spawn(pipe(a, b));

        left.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        right.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(left);

        let stats = timeout(Duration::from_secs(1), handle)
            .await
            .expect("pipe should finish")
            .unwrap();
        assert_eq!(stats, PipeStats { a_to_b: 5, b_to_a: 6 });
        assert_eq!(stats.total(), 11);
    }

    #[tokio::test]
    async fn test_closing_one_side_releases_the_other() {
        let (left, a) = duplex(1024);
        let (b, mut right) = duplex(1024);

        let handle = tokio::spawn(pipe(a, b));

        // `right` never writes; closing `left` must still end the pipe
        drop(left);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("pipe should finish")
            .unwrap();

        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(1), right.read_to_end(&mut rest))
            .await
            .expect("right side should see EOF")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_large_transfer_is_verbatim() {
        let (mut left, a) = duplex(8 * 1024);
        let (b, mut right) = duplex(8 * 1024);

        let handle = tokio::spawn(pipe(a, b));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            left.write_all(&payload).await.unwrap();
            left.shutdown().await.unwrap();
            left
        });

        let mut received = Vec::new();
        right.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let stats = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, expected.len() as u64);
    }
}
