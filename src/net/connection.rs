//! Connection tracking and per-connection activity.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count a server's open connections
//! - Record request activity so slow request heads and idle keep-alive
//!   connections can be closed

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Global counter for connection IDs. Relaxed is enough for uniqueness.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts the open connections of one server instance.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    open: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection. The count drops again with the guard.
    pub fn track(&self) -> ConnectionGuard {
        self.open.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            open: Arc::clone(&self.open),
            id: ConnectionId::new(),
        }
    }

    pub fn open_count(&self) -> u64 {
        self.open.load(Ordering::SeqCst)
    }
}

/// Held by a connection task for its whole lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    open: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[derive(Debug)]
struct ActivityState {
    in_flight: u64,
    last_active: Instant,
    /// Set while the connection waits on the rest of a request head.
    head_started: Option<Instant>,
}

/// Request activity on a single connection.
///
/// A connection is in one of three phases: reading a request head (bounded
/// by the read timeout), serving requests, or idle between requests
/// (bounded by the idle timeout). A fresh connection starts out reading.
#[derive(Debug, Clone)]
pub struct ConnectionActivity {
    inner: Arc<Mutex<ActivityState>>,
}

impl ConnectionActivity {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Mutex::new(ActivityState {
                in_flight: 0,
                last_active: now,
                head_started: Some(now),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ActivityState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a request as started; it ends when the guard drops.
    pub fn begin_request(&self) -> RequestGuard {
        let mut state = self.state();
        state.in_flight += 1;
        state.last_active = Instant::now();
        state.head_started = None;
        RequestGuard {
            activity: self.clone(),
        }
    }

    /// Bytes arrived from the peer. Between requests they open the next head.
    pub fn record_read(&self) {
        let mut state = self.state();
        if state.in_flight == 0 && state.head_started.is_none() {
            state.head_started = Some(Instant::now());
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.state().in_flight
    }

    /// Time spent on the current request head, if one is being read.
    pub fn head_read_for(&self) -> Option<Duration> {
        let state = self.state();
        match state.head_started {
            Some(started) if state.in_flight == 0 => Some(started.elapsed()),
            _ => None,
        }
    }

    /// Time since the last request finished, or `None` while one is running
    /// or a new head is being read.
    pub fn idle_for(&self) -> Option<Duration> {
        let state = self.state();
        if state.in_flight > 0 || state.head_started.is_some() {
            return None;
        }
        Some(state.last_active.elapsed())
    }
}

impl Default for ConnectionActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one in-flight request.
#[derive(Debug)]
pub struct RequestGuard {
    activity: ConnectionActivity,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let mut state = self.activity.state();
        state.in_flight -= 1;
        state.last_active = Instant::now();
    }
}

/// Byte stream that reports reads to a [`ConnectionActivity`].
#[derive(Debug)]
pub struct ActivityStream<S> {
    inner: S,
    activity: ConnectionActivity,
}

impl<S> ActivityStream<S> {
    pub fn new(inner: S, activity: ConnectionActivity) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.record_read();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
