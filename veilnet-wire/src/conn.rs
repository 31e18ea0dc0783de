//! Per-connection read/write task pair (`spec.md` §4.4, §5).
//!
//! Grounded on `freeq_server::iroh::handle_connection`'s split-stream,
//! two-cooperating-tasks pattern, and on `freeq_sdk::client`'s
//! `mpsc`-backed command channel for the outbound side. Generalized to
//! carry obfuscated, length-prefixed frames instead of IRC lines, and to
//! surface write-queue back-pressure as a value (`Enqueue`) rather than
//! blocking.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::error::WireError;
use crate::frame;
use crate::obfuscate::{self, Method};

/// Bound on the outbound frame queue (`spec.md` §4.4, §5: "capacity ≥ 64").
pub const WRITE_QUEUE_CAPACITY: usize = 64;

/// A live connection's write side. Cloning shares the same underlying
/// queue and cancellation token.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Enqueue an inner message frame for sending. Never blocks: a full
    /// queue is surfaced immediately as `Enqueue`, matching the
    /// back-pressure contract in `spec.md` §4.4.
    pub fn enqueue(&self, inner_msg: Vec<u8>) -> Result<(), WireError> {
        self.outbound_tx.try_send(inner_msg).map_err(|e| match e {
            TrySendError::Full(_) => WireError::Enqueue,
            TrySendError::Closed(_) => WireError::Closed,
        })
    }

    /// Tear down both tasks for this connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Split `stream` into cooperating read and write tasks framed and
/// obfuscated per `method`. Returns a handle for sending and a channel
/// of deframed, deobfuscated inbound payloads.
///
/// `parent_cancel` is observed in addition to the connection's own
/// token, so a `Node`-wide shutdown tears down every connection without
/// each caller having to cancel them individually.
pub fn spawn<S>(stream: S, method: Method, parent_cancel: CancellationToken) -> (ConnectionHandle, mpsc::Receiver<Vec<u8>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let cancel = parent_cancel.child_token();

    tokio::spawn(read_task(reader, method, inbound_tx, cancel.clone()));
    tokio::spawn(write_task(writer, method, outbound_rx, cancel.clone()));

    (ConnectionHandle { outbound_tx, cancel }, inbound_rx)
}

async fn read_task<R: AsyncRead + Unpin>(
    mut reader: R,
    method: Method,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            result = frame::read_frame(&mut reader) => match result {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::debug!(error = %e, "read task ending");
                    break;
                }
            },
        };

        let inner = match obfuscate::deobfuscate(method, &payload) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::warn!(error = %e, "dropping connection: deobfuscation failed");
                break;
            }
        };

        if inbound_tx.send(inner).await.is_err() {
            break;
        }
    }
    cancel.cancel();
}

async fn write_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    method: Method,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let inner = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = outbound_rx.recv() => match maybe {
                Some(inner) => inner,
                None => break,
            },
        };

        let obf = obfuscate::obfuscate(method, &inner);
        if let Err(e) = frame::write_frame(&mut writer, &obf).await {
            tracing::debug!(error = %e, "write task ending");
            break;
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_round_trip_over_a_duplex_pair() {
        let (a, b) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let (handle_a, mut inbound_a) = spawn(a, Method::Raw, cancel.clone());
        let (handle_b, mut inbound_b) = spawn(b, Method::HttpLooking, cancel.clone());

        handle_a.enqueue(b"ping".to_vec()).unwrap();
        let received = inbound_b.recv().await.unwrap();
        assert_eq!(received, b"ping");

        handle_b.enqueue(b"pong".to_vec()).unwrap();
        let received = inbound_a.recv().await.unwrap();
        assert_eq!(received, b"pong");

        cancel.cancel();
    }

    #[tokio::test]
    async fn full_queue_surfaces_enqueue_error() {
        let (a, _b) = tokio::io::duplex(16); // tiny buffer stalls the write task
        let cancel = CancellationToken::new();
        let (handle, _inbound) = spawn(a, Method::Raw, cancel.clone());

        let mut last_err = None;
        for i in 0..WRITE_QUEUE_CAPACITY + 8 {
            if let Err(e) = handle.enqueue(vec![0xAB; 64]) {
                last_err = Some((i, e));
                break;
            }
        }
        assert!(matches!(last_err, Some((_, WireError::Enqueue))));
        cancel.cancel();
    }
}
