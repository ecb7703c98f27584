//! Server run loop: binds connections to the dispatcher and drives
//! graceful shutdown.
//!
//! Grounded on the teacher's `server::run`, which takes a
//! `shutdown: impl Future` and fans a `broadcast` signal out to every
//! in-flight `Handler` so it drains before the process exits. Here the
//! per-connection fan-out is [`crate::connection::Connection::close`]
//! (already idempotent and drain-aware, see spec.md §4.1) rather than a
//! `Shutdown`/`broadcast::Receiver` pair threaded through a read loop, so
//! `Dispatcher::shutdown_all` simply closes every live connection and
//! awaits each one. The DCC relay engine is folded into the same
//! shutdown path (spec.md §4.5, §5): a `ctrl_c` mid-transfer still
//! converges through exactly one `TransferClosed` per outstanding token
//! before the process exits.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::acceptor::Acceptor;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionLimits};
use crate::dcc::DccRelayEngine;
use crate::dispatcher::Dispatcher;
use crate::state::ServerState;

/// Runs the accept loop until `shutdown` resolves, then drains every
/// live connection and the DCC relay engine before returning.
#[instrument(skip_all)]
pub async fn run(acceptor: Acceptor, config: ServerConfig, dcc: DccRelayEngine, shutdown: impl Future<Output = ()>) {
    let state = ServerState::new(config.clone());
    let dispatcher = Dispatcher::new(state, config.clone());
    dispatcher.spawn_idle_sweeper();

    let next_conn_id = Arc::new(AtomicU64::new(1));
    let limits = ConnectionLimits {
        max_line_length: config.max_line_length,
        egress_queue_capacity: config.egress_queue_capacity,
        read_timeout: config.ping_deadline,
        close_drain: config.connection_close_drain,
    };

    let accept_dispatcher = dispatcher.clone();
    let accept_task = tokio::spawn(async move {
        acceptor
            .run(move |stream, addr| {
                let dispatcher = accept_dispatcher.clone();
                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                async move {
                    info!(conn_id, %addr, "connection accepted");
                    let connection = Connection::new(stream, limits);

                    let handler_dispatcher = dispatcher.clone();
                    connection
                        .register_ingress_handler(Arc::new(move |line: String| {
                            let dispatcher = handler_dispatcher.clone();
                            Box::pin(async move { dispatcher.handle_line(conn_id, line).await }) as crate::connection::BoxFuture<crate::Result<()>>
                        }))
                        .await;

                    let disconnect_dispatcher = dispatcher.clone();
                    connection
                        .register_disconnect_handler(Arc::new(move || {
                            let dispatcher = disconnect_dispatcher.clone();
                            tokio::spawn(async move { dispatcher.handle_disconnect(conn_id).await });
                        }))
                        .await;

                    dispatcher.register_connection(conn_id, connection.clone()).await;
                    if let Err(err) = connection.start().await {
                        error!(conn_id, %err, "connection start failed");
                    }
                }
            })
            .await;
    });

    shutdown.await;
    info!("shutdown signal received, draining connections");
    accept_task.abort();
    dispatcher.shutdown_all().await;
    dcc.close().await;
}
