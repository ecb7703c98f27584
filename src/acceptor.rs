//! Listening-socket accept loop with capped exponential backoff.
//!
//! Grounded on the teacher's `Listener::run` in `server.rs`, which doubles
//! a backoff delay on `accept` errors up to a ceiling. spec.md §4.2 pins
//! the exact formula: no backoff on the first failure, then
//! `min(1600, 50 * 2^min(failures - 2, 5))` milliseconds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

/// Caps backoff at 1.6s, matching spec.md §4.2.
const MAX_BACKOFF_MS: u64 = 1_600;
const BASE_BACKOFF_MS: u64 = 50;

fn backoff_for(consecutive_failures: u32) -> Duration {
    if consecutive_failures <= 1 {
        return Duration::from_millis(0);
    }
    let exp = consecutive_failures.saturating_sub(2).min(5);
    let ms = BASE_BACKOFF_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(ms.min(MAX_BACKOFF_MS))
}

/// Accepts connections on one bound listener and dispatches each to a
/// handler. `bind` may be called against a single port or iterate a
/// configured port range (used by the DCC relay for its ephemeral
/// listening endpoints).
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub async fn bind(host: &str, port: u16) -> std::io::Result<Acceptor> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Acceptor { listener })
    }

    /// Binds the first free port in `[start, end]`, returning the bound
    /// `Acceptor` and the port it took. Used by the DCC relay to hand out
    /// ephemeral SEND/RESUME listening endpoints from a configured range.
    pub async fn bind_in_range(host: &str, start: u16, end: u16) -> std::io::Result<(Acceptor, u16)> {
        for port in start..=end {
            match TcpListener::bind((host, port)).await {
                Ok(listener) => return Ok((Acceptor { listener }, port)),
                Err(_) => continue,
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free port in configured range",
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections in a loop, invoking `on_accept` with each
    /// socket, until a transient error streak is broken by backing off,
    /// or the listener is dropped. Runs until the process is told to
    /// shut down; callers spawn this as its own task.
    #[instrument(skip(self, on_accept))]
    pub async fn run<F, Fut>(self, on_accept: F)
    where
        F: Fn(TcpStream, std::net::SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let on_accept = Arc::new(on_accept);
        let mut consecutive_failures: u32 = 0;

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    consecutive_failures = 0;
                    info!(%addr, "accepted connection");
                    let handler = on_accept.clone();
                    tokio::spawn(async move { handler(stream, addr).await });
                }
                Err(err) => {
                    consecutive_failures += 1;
                    let delay = backoff_for(consecutive_failures);
                    warn!(error = %err, consecutive_failures, delay_ms = delay.as_millis() as u64, "accept failed");
                    if delay.is_zero() {
                        continue;
                    }
                    sleep(delay).await;
                }
            }
        }
    }

    /// Accepts exactly one connection, used by DCC pairing where the
    /// listening endpoint is single-shot rather than long-lived.
    pub async fn accept_once(self) -> std::io::Result<(TcpStream, std::net::SocketAddr)> {
        self.listener.accept().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backoff_on_first_failure() {
        assert_eq!(backoff_for(1), Duration::from_millis(0));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_for(2), Duration::from_millis(50));
        assert_eq!(backoff_for(3), Duration::from_millis(100));
        assert_eq!(backoff_for(4), Duration::from_millis(200));
        assert_eq!(backoff_for(7), Duration::from_millis(1_600));
        assert_eq!(backoff_for(50), Duration::from_millis(1_600));
    }

    #[tokio::test]
    async fn bind_in_range_finds_a_free_port() {
        let (acceptor, port) = Acceptor::bind_in_range("127.0.0.1", 50_000, 50_050).await.unwrap();
        assert!((50_000..=50_050).contains(&port));
        assert_eq!(acceptor.local_addr().unwrap().port(), port);
    }
}
