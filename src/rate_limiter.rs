//! Token-bucket rate limiter wrapping an async reader (SPEC_FULL.md §4.11).
//!
//! Grounded in the teacher's `ChecksumReader` (a transparent `Read`
//! wrapper that accumulates state as bytes flow through) but throttling
//! instead of hashing, and async instead of sync since the core's I/O
//! surface is `tokio::io::AsyncRead`.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, ReadBuf};

use crate::config::DynamicSettings;

/// Per-operation throttling accounting, shared across every stream wrapped
/// by the same repository instance.
#[derive(Default)]
pub struct ThrottleCounters {
    snapshot_throttle_nanos: AtomicU64,
    restore_throttle_nanos: AtomicU64,
}

impl ThrottleCounters {
    pub fn snapshot_throttle_nanos(&self) -> u64 {
        self.snapshot_throttle_nanos.load(Ordering::Relaxed)
    }

    pub fn restore_throttle_nanos(&self) -> u64 {
        self.restore_throttle_nanos.load(Ordering::Relaxed)
    }

    fn add_snapshot(&self, nanos: u64) {
        self.snapshot_throttle_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    fn add_restore(&self, nanos: u64) {
        self.restore_throttle_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleKind {
    Snapshot,
    Restore,
}

struct TokenBucket {
    bytes_per_sec: u64,
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            available: bytes_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    /// Returns the delay the caller must wait before `want` more bytes may
    /// be consumed, and debits the bucket accordingly.
    fn take(&mut self, want: u64) -> Duration {
        if self.bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available = (self.available + elapsed * self.bytes_per_sec as f64).min(self.bytes_per_sec as f64);

        if self.available >= want as f64 {
            self.available -= want as f64;
            return Duration::ZERO;
        }

        let deficit = want as f64 - self.available;
        self.available = 0.0;
        Duration::from_secs_f64(deficit / self.bytes_per_sec as f64)
    }
}

/// Wraps an `AsyncRead` and throttles it to the dynamic settings' current
/// rate, accumulating throttled time into the shared [`ThrottleCounters`].
/// The limiter is read fresh from [`DynamicSettings`] on every poll, so a
/// setting change takes effect on the stream's very next read -- mirroring
/// "the limiter is replaced atomically on setting change; existing streams
/// update on next read" (SPEC_FULL.md §4.11).
pub struct RateLimitedReader<R> {
    inner: R,
    kind: ThrottleKind,
    settings: DynamicSettings,
    counters: Arc<ThrottleCounters>,
    bucket: TokenBucket,
    sleeping: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<R: AsyncRead + Unpin> RateLimitedReader<R> {
    pub fn new(inner: R, kind: ThrottleKind, settings: DynamicSettings, counters: Arc<ThrottleCounters>) -> Self {
        let rate = match kind {
            ThrottleKind::Snapshot => settings.max_snapshot_bytes_per_sec(),
            ThrottleKind::Restore => settings.max_restore_bytes_per_sec(),
        };
        Self {
            inner,
            kind,
            settings,
            counters,
            bucket: TokenBucket::new(rate),
            sleeping: None,
        }
    }

    fn current_rate(&self) -> u64 {
        match self.kind {
            ThrottleKind::Snapshot => self.settings.max_snapshot_bytes_per_sec(),
            ThrottleKind::Restore => self.settings.max_restore_bytes_per_sec(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RateLimitedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(sleep) = self.sleeping.as_mut() {
            match sleep.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => {
                    self.sleeping = None;
                }
            }
        }

        self.bucket.bytes_per_sec = self.current_rate();

        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let produced = (buf.filled().len() - before) as u64;
            if produced > 0 {
                let delay = self.bucket.take(produced);
                if !delay.is_zero() {
                    let nanos = delay.as_nanos() as u64;
                    match self.kind {
                        ThrottleKind::Snapshot => self.counters.add_snapshot(nanos),
                        ThrottleKind::Restore => self.counters.add_restore(nanos),
                    }
                    self.sleeping = Some(Box::pin(tokio::time::sleep(delay)));
                }
            }
        }

        poll
    }
}
