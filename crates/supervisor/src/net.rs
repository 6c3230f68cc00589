//! Port allocation and liveness probing.

use std::time::Duration;

use {
    tokio::{
        net::{TcpListener, TcpStream},
        time::{Instant, sleep, timeout},
    },
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

/// Upper bound on a single connect attempt.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProbe {
    Open,
    TimedOut,
    /// `abort` fired first (for example the child exited).
    Aborted,
}

/// Ask the OS for a free port on `host`.
///
/// The port is released before returning, so another process may grab it
/// in between; callers treat a failed bind downstream as a startup failure.
pub async fn allocate_port(host: &str) -> std::io::Result<u16> {
    let listener = TcpListener::bind((host, 0)).await?;
    let port = listener.local_addr()?.port();
    debug!(host, port, "allocated port");
    Ok(port)
}

/// Poll `(host, port)` until a connection succeeds, `limit` elapses or
/// `abort` fires.
pub async fn wait_for_port(
    host: &str,
    port: u16,
    limit: Duration,
    interval: Duration,
    abort: &CancellationToken,
) -> PortProbe {
    let deadline = Instant::now() + limit;
    loop {
        if abort.is_cancelled() {
            return PortProbe::Aborted;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return PortProbe::TimedOut;
        }

        let attempt = timeout(remaining.min(CONNECT_ATTEMPT_TIMEOUT), TcpStream::connect((host, port)));
        if let Ok(Ok(_stream)) = attempt.await {
            debug!(host, port, "port is accepting connections");
            return PortProbe::Open;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            () = abort.cancelled() => return PortProbe::Aborted,
            () = sleep(interval.min(remaining)) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = wait_for_port(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(probe, PortProbe::Open);
    }

    #[tokio::test]
    async fn closed_port_times_out() {
        let port = allocate_port("127.0.0.1").await.unwrap();
        let started = std::time::Instant::now();
        let probe = wait_for_port(
            "127.0.0.1",
            port,
            Duration::from_millis(200),
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(probe, PortProbe::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn abort_wins_over_waiting() {
        let port = allocate_port("127.0.0.1").await.unwrap();
        let abort = CancellationToken::new();
        abort.cancel();
        let probe = wait_for_port(
            "127.0.0.1",
            port,
            Duration::from_secs(10),
            Duration::from_millis(20),
            &abort,
        )
        .await;
        assert_eq!(probe, PortProbe::Aborted);
    }

    #[tokio::test]
    async fn allocated_ports_are_bindable() {
        let port = allocate_port("127.0.0.1").await.unwrap();
        assert_ne!(port, 0);
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }
}
