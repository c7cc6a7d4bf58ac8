//! Stream plumbing shared by the tunnel and forward paths.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Relay buffer size. Bodies and tunnel traffic larger than this are
/// copied in several reads.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// A client connection after the listener has wrapped it in a buffered
/// reader: plain TCP or TLS, read through the buffer, written directly.
pub trait ClientStream: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> ClientStream for T {}

/// Run an I/O future under a deadline, mapping expiry to `TimedOut`.
pub async fn timed<F, T>(limit: Duration, what: &str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out after {:?}", what, limit),
        )),
    }
}

/// Copy until EOF, failing if any single read or write stalls longer than
/// `idle`. `copied` is updated as data moves, so callers see partial
/// progress even if this future is dropped.
pub async fn copy_with_idle_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = timed(idle, "read", reader.read(&mut buf)).await?;
        if n == 0 {
            break;
        }
        timed(idle, "write", writer.write_all(&buf[..n])).await?;
        *copied += n as u64;
        timed(idle, "flush", writer.flush()).await?;
    }
    Ok(())
}

/// Last time any byte moved through a relay, shared by both directions of
/// a tunnel so that traffic either way keeps the whole tunnel alive.
#[derive(Debug)]
pub struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record traffic now.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// When the relay goes idle if nothing else moves.
    #[must_use]
    pub fn deadline(&self, idle: Duration) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + idle
    }

    /// Resolves once `idle` passes with no call to [`Activity::touch`].
    pub async fn idle_for(&self, idle: Duration) {
        loop {
            let deadline = self.deadline(idle);
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy until EOF, touching `activity` after every write. Reads wait as
/// long as needed; only a write stalled longer than `idle` fails here.
/// Overall idleness is left to the owner of `activity`.
pub async fn copy_with_activity<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    activity: &Activity,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        activity.touch();
        timed(idle, "write", writer.write_all(&buf[..n])).await?;
        *copied += n as u64;
        timed(idle, "flush", writer.flush()).await?;
        activity.touch();
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_spans_multiple_buffers() {
        let data = vec![7u8; RELAY_BUFFER_SIZE * 3 + 17];
        let mut reader = data.as_slice();
        let mut out = Vec::new();
        let mut copied = 0;
        copy_with_idle_timeout(&mut reader, &mut out, Duration::from_secs(5), &mut copied)
            .await
            .unwrap();
        assert_eq!(out, data);
        assert_eq!(copied, data.len() as u64);
    }

    #[tokio::test]
    async fn test_copy_idle_timeout() {
        let (mut silent, _keep_open) = tokio::io::duplex(64);
        let mut out = Vec::new();
        let mut copied = 0;
        let err = copy_with_idle_timeout(
            &mut silent,
            &mut out,
            Duration::from_millis(50),
            &mut copied,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(copied, 0);
    }

    #[tokio::test]
    async fn test_timed_passes_result_through() {
        let value = timed(Duration::from_secs(1), "noop", async { Ok::<_, io::Error>(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_activity_pushes_deadline() {
        let idle = Duration::from_millis(200);
        let activity = Activity::new();
        let first = activity.deadline(idle);

        tokio::time::sleep(Duration::from_millis(50)).await;
        activity.touch();
        assert!(activity.deadline(idle) > first);

        let start = Instant::now();
        activity.idle_for(idle).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_copy_with_activity_touches() {
        let data = vec![1u8; 100];
        let mut reader = data.as_slice();
        let mut out = Vec::new();
        let mut copied = 0;
        let activity = Activity::new();
        let before = activity.deadline(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        copy_with_activity(&mut reader, &mut out, Duration::from_secs(5), &activity, &mut copied)
            .await
            .unwrap();
        assert_eq!(copied, 100);
        assert!(activity.deadline(Duration::ZERO) > before);
    }
}
