//! TCP listener and the accept/drain loop of one server instance.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept connections and serve HTTP/1.1 on each
//! - Close connections that take too long to send a request head
//! - Close keep-alive connections that sit idle too long
//! - On stop: release the port, drain connections, abort stragglers

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tower::ServiceExt;

use crate::config::schema::TimeoutConfig;
use crate::net::connection::{
    ActivityStream, ConnectionActivity, ConnectionGuard, ConnectionTracker,
};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// A bound TCP listener.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(address: &str) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            address: address.to_string(),
            source,
        };

        let inner = TcpListener::bind(address).await.map_err(bind_err)?;
        let local_addr = inner.local_addr().map_err(bind_err)?;

        tracing::info!(address = %local_addr, "Listener bound");
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// How a stopped server left its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection finished within the deadline.
    Drained { connections: usize },
    /// The deadline passed and the remaining connections were aborted.
    DeadlineExceeded { aborted: usize },
}

/// Serve `router` on `listener` until `stop` delivers a drain deadline.
///
/// The listener is dropped before draining starts, so the address is free
/// by the time this returns.
pub async fn serve(
    listener: Listener,
    router: Router,
    timeouts: TimeoutConfig,
    tracker: ConnectionTracker,
    mut stop: oneshot::Receiver<Duration>,
) -> DrainOutcome {
    let (drain_tx, _) = watch::channel(false);
    let mut connections = JoinSet::new();

    let grace = loop {
        tokio::select! {
            // A dropped handle means nobody is waiting for a graceful drain.
            grace = &mut stop => break grace.unwrap_or(Duration::ZERO),
            accepted = listener.inner.accept() => match accepted {
                Ok((stream, peer)) => {
                    let guard = tracker.track();
                    tracing::debug!(
                        connection_id = %guard.id(),
                        peer_addr = %peer,
                        "Connection accepted"
                    );
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        router.clone(),
                        timeouts,
                        drain_tx.subscribe(),
                        guard,
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }
    };

    let local_addr = listener.local_addr;
    drop(listener);

    let open = connections.len();
    tracing::info!(address = %local_addr, open_connections = open, "Listener closed, draining");
    drain_tx.send_replace(true);

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await
    .is_ok();

    if drained {
        DrainOutcome::Drained { connections: open }
    } else {
        let aborted = connections.len();
        connections.shutdown().await;
        DrainOutcome::DeadlineExceeded { aborted }
    }
}

fn deadline_check_period(shortest: Duration) -> Duration {
    (shortest / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    timeouts: TimeoutConfig,
    mut drain: watch::Receiver<bool>,
    guard: ConnectionGuard,
) {
    let activity = ConnectionActivity::new();
    let service = {
        let activity = activity.clone();
        service_fn(move |request: Request<Incoming>| {
            let in_flight = activity.begin_request();
            let router = router.clone();
            async move {
                let response = router.oneshot(request).await;
                drop(in_flight);
                response
            }
        })
    };

    // hyper would apply its header timeout to the wait between keep-alive
    // requests too, cutting idle connections short. Both deadlines are
    // enforced below instead.
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(None)
        .keep_alive(true);
    let io = TokioIo::new(ActivityStream::new(stream, activity.clone()));
    let mut conn = std::pin::pin!(builder.serve_connection(io, service));

    let read = timeouts.read();
    let idle = timeouts.idle();
    let mut deadline_check = tokio::time::interval(deadline_check_period(read.min(idle)));
    deadline_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closing = false;

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, error = %e, "Connection error");
                }
                break;
            }
            // Either a drain signal or the server loop going away.
            _ = drain.changed(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = deadline_check.tick() => {
                if activity.head_read_for().is_some_and(|elapsed| elapsed >= read) {
                    tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, "Request head not received in time");
                    break;
                }
                if !closing && activity.idle_for().is_some_and(|elapsed| elapsed >= idle) {
                    tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, "Closing idle connection");
                    closing = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn timeouts(idle_secs: u64) -> TimeoutConfig {
        TimeoutConfig {
            read_secs: 5,
            write_secs: 10,
            idle_secs,
        }
    }

    /// Serve a trivial router. The server runs until the sender drops.
    async fn spawn_server(
        timeouts: TimeoutConfig,
    ) -> (SocketAddr, ConnectionTracker, oneshot::Sender<Duration>) {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let router = Router::new().route("/", get(|| async { "ok" }));
        let tracker = ConnectionTracker::new();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(serve(listener, router, timeouts, tracker.clone(), stop_rx));
        (addr, tracker, stop_tx)
    }

    async fn get_over(stream: &mut TcpStream) -> String {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn deadline_check_period_is_bounded() {
        assert_eq!(deadline_check_period(Duration::from_secs(15)), Duration::from_secs(1));
        assert_eq!(deadline_check_period(Duration::from_millis(100)), Duration::from_millis(25));
        assert_eq!(deadline_check_period(Duration::ZERO), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn bind_failure_names_the_address() {
        let taken = Listener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().to_string();

        let err = Listener::bind(&address).await.unwrap_err();
        assert!(err.to_string().contains(&address));
    }

    #[tokio::test]
    async fn stop_releases_the_port() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let router = Router::new().route("/", get(|| async { "ok" }));
        let (stop_tx, stop_rx) = oneshot::channel();

        let runner = tokio::spawn(serve(
            listener,
            router,
            timeouts(15),
            ConnectionTracker::new(),
            stop_rx,
        ));

        stop_tx.send(Duration::from_secs(1)).unwrap();
        assert_eq!(runner.await.unwrap(), DrainOutcome::Drained { connections: 0 });

        // Same port can be bound again.
        Listener::bind(&addr.to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn idle_keep_alive_connection_is_closed() {
        let (addr, tracker, _stop) = spawn_server(timeouts(1)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let response = get_over(&mut stream).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert_eq!(tracker.open_count(), 1);

        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "idle connection was not closed");
    }

    #[tokio::test]
    async fn idle_timeout_outlasts_shorter_read_timeout() {
        let (addr, _tracker, _stop) = spawn_server(TimeoutConfig {
            read_secs: 1,
            write_secs: 10,
            idle_secs: 3,
        })
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let response = get_over(&mut stream).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        let started = tokio::time::Instant::now();

        // Still open well past the read timeout.
        let mut rest = Vec::new();
        let early = tokio::time::timeout(Duration::from_millis(2000), stream.read_to_end(&mut rest)).await;
        assert!(early.is_err(), "keep-alive connection closed by the read timeout");

        let closed = tokio::time::timeout(Duration::from_secs(4), stream.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "idle connection was not closed");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2900), "closed after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "closed after {:?}", elapsed);
    }

    #[tokio::test]
    async fn kept_alive_connection_serves_a_second_request() {
        let (addr, _tracker, _stop) = spawn_server(TimeoutConfig {
            read_secs: 1,
            write_secs: 10,
            idle_secs: 5,
        })
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert!(get_over(&mut stream).await.starts_with("HTTP/1.1 200"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(get_over(&mut stream).await.starts_with("HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn slow_request_head_is_cut_off_at_read_timeout() {
        let (addr, tracker, _stop) = spawn_server(TimeoutConfig {
            read_secs: 1,
            write_secs: 10,
            idle_secs: 15,
        })
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "partial request head kept the connection open");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tracker.open_count(), 0);
    }

    #[tokio::test]
    async fn head_after_idle_gap_gets_its_own_read_deadline() {
        let (addr, _tracker, _stop) = spawn_server(TimeoutConfig {
            read_secs: 1,
            write_secs: 10,
            idle_secs: 15,
        })
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert!(get_over(&mut stream).await.starts_with("HTTP/1.1 200"));

        // Start the next head but never finish it.
        stream.write_all(b"GET / HT").await.unwrap();
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "stalled second head kept the connection open");
    }

    #[tokio::test]
    async fn stuck_connection_is_aborted_at_deadline() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let router = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
        let tracker = ConnectionTracker::new();
        let (stop_tx, stop_rx) = oneshot::channel();
        let runner = tokio::spawn(serve(listener, router, timeouts(15), tracker.clone(), stop_rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop_tx.send(Duration::from_millis(200)).unwrap();
        assert_eq!(
            runner.await.unwrap(),
            DrainOutcome::DeadlineExceeded { aborted: 1 }
        );
        assert_eq!(tracker.open_count(), 0);
    }
}
