//! Byte-pump tasks: verbatim relay of one direction of a paired DCC
//! transfer.
//!
//! See spec.md §4.5: sender→receiver pumps with a 32 KiB buffer (bulk
//! data), receiver→sender with a 1 KiB buffer (acknowledgements). Each
//! pump runs until EOF on its source, then flushes and half-closes the
//! destination and returns; it never touches engine state directly (see
//! spec.md §4.5 "Concurrency discipline").

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, instrument};

pub const SENDER_TO_RECEIVER_BUF: usize = 32 * 1024;
pub const RECEIVER_TO_SENDER_BUF: usize = 1024;

/// Relays bytes from `source` to `dest` until EOF or an I/O error.
/// Always attempts to flush and half-close `dest`'s write side before
/// returning, even on error, so the peer observes a clean FIN rather
/// than a silent hang.
#[instrument(skip(source, dest), fields(label))]
pub async fn pump(
    label: &'static str,
    mut source: OwnedReadHalf,
    mut dest: OwnedWriteHalf,
    buf_size: usize,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; buf_size];
    let result = loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(err) => break Err(err),
        };
        if let Err(err) = dest.write_all(&buf[..n]).await {
            break Err(err);
        }
    };

    let flush_result = dest.flush().await;
    let shutdown_result = dest.shutdown().await;
    debug!(label, ?result, "pump finished");

    result.and(flush_result).and(shutdown_result)
}
