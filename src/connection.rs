//! A full-duplex, line-oriented, back-pressured connection.
//!
//! Grounded on the teacher's `Connection`/`Handler` split in
//! `connection.rs`/`server.rs`: one task reads frames and hands them to
//! registered handlers, one task drains an outgoing queue. Here the two
//! tasks are long-lived and explicitly staged through the lifecycle
//! spec.md §4.1 describes (`NEW -> INITIALIZING -> ACTIVE -> CLOSING ->
//! CLOSED`) rather than ending when the handler function returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify, OnceCell, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

use crate::line_codec::LineReader;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type IngressHandler = Arc<dyn Fn(String) -> BoxFuture<crate::Result<()>> + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    New = 0,
    Initializing = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::New,
            1 => ConnectionState::Initializing,
            2 => ConnectionState::Active,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

enum EgressItem {
    Line(String),
    WakeUp,
}

/// Tuning knobs a [`Connection`] needs; a narrow view onto
/// [`crate::config::ServerConfig`] so connection.rs doesn't depend on
/// the whole config module.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_line_length: usize,
    pub egress_queue_capacity: usize,
    pub read_timeout: Duration,
    pub close_drain: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        ConnectionLimits {
            max_line_length: 10_000,
            egress_queue_capacity: 200,
            read_timeout: Duration::from_secs(10 * 60),
            close_drain: Duration::from_secs(5),
        }
    }
}

struct Inner {
    state: AtomicU8,
    stream: Mutex<Option<TcpStream>>,
    egress_tx: mpsc::Sender<EgressItem>,
    egress_rx: Mutex<Option<mpsc::Receiver<EgressItem>>>,
    ingress_handlers: RwLock<Vec<IngressHandler>>,
    disconnect_handlers: RwLock<Vec<DisconnectHandler>>,
    writer_done: Notify,
    closed_notify: Notify,
    close_once: OnceCell<()>,
    limits: ConnectionLimits,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_closing_or_closed(&self) -> bool {
        matches!(self.state(), ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// A full-duplex, line-oriented connection with bounded, back-pressured
/// egress and deferred, drained shutdown.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(stream: TcpStream, limits: ConnectionLimits) -> Connection {
        let (egress_tx, egress_rx) = mpsc::channel(limits.egress_queue_capacity);
        Connection {
            inner: Arc::new(Inner {
                state: AtomicU8::new(ConnectionState::New as u8),
                stream: Mutex::new(Some(stream)),
                egress_tx,
                egress_rx: Mutex::new(Some(egress_rx)),
                ingress_handlers: RwLock::new(Vec::new()),
                disconnect_handlers: RwLock::new(Vec::new()),
                writer_done: Notify::new(),
                closed_notify: Notify::new(),
                close_once: OnceCell::new(),
                limits,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Registers an ingress handler. Handlers run in registration order
    /// for every line; if one returns `Err`, later handlers are skipped
    /// for that line and the connection is closed.
    pub async fn register_ingress_handler(&self, handler: IngressHandler) {
        self.inner.ingress_handlers.write().await.push(handler);
    }

    /// Registers a disconnect handler. All registered handlers run
    /// exactly once, regardless of how many times `close` is called.
    pub async fn register_disconnect_handler(&self, handler: DisconnectHandler) {
        self.inner.disconnect_handlers.write().await.push(handler);
    }

    /// Enqueues `line` for transmission. Non-blocking: returns `false`
    /// immediately if the connection isn't `ACTIVE` or the egress queue
    /// is full.
    pub fn offer(&self, line: impl Into<String>) -> bool {
        if self.inner.state() != ConnectionState::Active {
            return false;
        }
        self.inner.egress_tx.try_send(EgressItem::Line(line.into())).is_ok()
    }

    /// Starts the ingress and egress tasks. May be called exactly once.
    #[instrument(skip(self))]
    pub async fn start(&self) -> crate::Result<()> {
        match self.inner.state.compare_exchange(
            ConnectionState::New as u8,
            ConnectionState::Initializing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(_) => return Err("connection already started".into()),
        }

        let stream = self.inner.stream.lock().await.take().ok_or("connection stream already taken")?;
        let (read_half, write_half) = tokio::io::split(stream);
        let rx = self.inner.egress_rx.lock().await.take().ok_or("egress receiver already taken")?;

        self.inner.state.store(ConnectionState::Active as u8, Ordering::SeqCst);

        tokio::spawn(ingress_loop(self.inner.clone(), read_half));
        tokio::spawn(egress_loop(self.inner.clone(), write_half, rx));

        Ok(())
    }

    /// Transitions to `CLOSING`, drains the writer, closes the socket,
    /// runs disconnect handlers exactly once, and transitions to
    /// `CLOSED`. Safe to call any number of times, concurrently.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Non-blocking variant of [`Connection::close`]: returns immediately
    /// and hands back a future that resolves once the connection reaches
    /// `CLOSED`.
    pub fn close_deferred(&self) -> impl Future<Output = ()> + 'static {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.close().await });
        let waiter = self.inner.clone();
        async move { waiter.wait_closed().await }
    }
}

impl Inner {
    #[instrument(skip(self))]
    async fn close(self: &Arc<Self>) {
        let this = self.clone();
        self.close_once
            .get_or_init(|| async move {
                this.state.store(ConnectionState::Closing as u8, Ordering::SeqCst);
                let _ = this.egress_tx.try_send(EgressItem::WakeUp);

                if timeout(this.limits.close_drain, this.writer_done.notified()).await.is_err() {
                    warn!("writer did not drain within close_drain deadline");
                }

                if let Some(stream) = this.stream.lock().await.take() {
                    let _ = stream.set_linger(Some(Duration::from_secs(0)));
                    drop(stream);
                }

                let handlers = this.disconnect_handlers.read().await.clone();
                for handler in handlers.iter() {
                    let handler = handler.clone();
                    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler())) {
                        error!(?panic, "disconnect handler panicked");
                    }
                }

                this.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
                this.closed_notify.notify_waiters();
            })
            .await;
    }

    async fn wait_closed(&self) {
        loop {
            if self.state() == ConnectionState::Closed {
                return;
            }
            self.closed_notify.notified().await;
        }
    }
}

#[instrument(skip(inner, read_half))]
async fn ingress_loop(inner: Arc<Inner>, read_half: ReadHalf<TcpStream>) {
    let mut reader = LineReader::new(read_half, inner.limits.max_line_length);

    loop {
        if inner.is_closing_or_closed() {
            return;
        }
        match timeout(inner.limits.read_timeout, reader.read_line()).await {
            Ok(Ok(Some(line))) => {
                let handlers = inner.ingress_handlers.read().await.clone();
                let mut handler_failed = false;
                for handler in &handlers {
                    if let Err(err) = handler(line.clone()).await {
                        warn!(error = %err, "ingress handler failed, closing connection");
                        handler_failed = true;
                        break;
                    }
                }
                if handler_failed {
                    inner.close().await;
                    return;
                }
            }
            Ok(Ok(None)) => {
                debug!("peer closed connection (EOF)");
                inner.close().await;
                return;
            }
            Ok(Err(err)) => {
                error!(error = %err, "ingress io error");
                inner.close().await;
                return;
            }
            Err(_elapsed) => {
                debug!("read timeout, closing connection");
                inner.close().await;
                return;
            }
        }
    }
}

#[instrument(skip(inner, write_half, rx))]
async fn egress_loop(
    inner: Arc<Inner>,
    mut write_half: WriteHalf<TcpStream>,
    mut rx: mpsc::Receiver<EgressItem>,
) {
    loop {
        match timeout(Duration::from_millis(250), rx.recv()).await {
            Ok(Some(EgressItem::Line(line))) => {
                if let Err(err) = write_line(&mut write_half, &line).await {
                    error!(error = %err, "egress io error");
                    inner.close().await;
                    break;
                }
            }
            Ok(Some(EgressItem::WakeUp)) => {
                if inner.is_closing_or_closed() {
                    // Keep draining until the queue is empty, then stop.
                    if rx.is_empty() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(_elapsed) => {
                if inner.is_closing_or_closed() && rx.is_empty() {
                    break;
                }
            }
        }
    }
    inner.writer_done.notify_waiters();
}

async fn write_line(write_half: &mut WriteHalf<TcpStream>, line: &str) -> std::io::Result<()> {
    write_half.write_all(line.as_bytes()).await?;
    write_half.write_all(b"\r\n").await?;
    write_half.flush().await
}
