//! Per-connection plumbing.
//!
//! Each accepted or dialed connection gets a read task and a write task. The
//! read task turns wire lines into [`Event::Message`]s; the write task drains
//! an owned outbound queue. The event loop holds a [`Connection`] handle and
//! never touches the socket directly.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::select;
use tokio::sync::{mpsc, watch};

use minnow_proto::{Message, MessageError};

use crate::event::Event;

/// Locally-unique client id, minted from a process-wide monotonic counter.
pub type ClientId = u64;

/// Depth of a connection's outbound queue. Exceeding it marks the connection
/// for termination on the next tick.
pub const SEND_QUEUE_LEN: usize = 1024;

/// The event loop's handle to one connection.
///
/// Sending never blocks: messages are queued for the write task with
/// `try_send`, and a full queue raises the send-queue-exceeded flag instead
/// of waiting.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ClientId,
    pub remote_addr: IpAddr,
    pub tls: bool,
    outbound: mpsc::Sender<String>,
    exceeded: Arc<AtomicBool>,
    close: Arc<watch::Sender<bool>>,
}

/// The I/O tasks' ends of a [`Connection`].
pub struct ConnectionRx {
    pub outbound: mpsc::Receiver<String>,
    pub closed: watch::Receiver<bool>,
}

impl Connection {
    pub fn open(id: ClientId, remote_addr: IpAddr, tls: bool) -> (Self, ConnectionRx) {
        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_LEN);
        let (close_tx, close_rx) = watch::channel(false);
        (
            Self {
                id,
                remote_addr,
                tls,
                outbound: outbound_tx,
                exceeded: Arc::new(AtomicBool::new(false)),
                close: Arc::new(close_tx),
            },
            ConnectionRx {
                outbound: outbound_rx,
                closed: close_rx,
            },
        )
    }

    /// Queue a message for delivery. A message that fails to encode is
    /// dropped with a warning; it cannot be represented on the wire.
    pub fn send(&self, message: &Message) {
        match message.encode() {
            Ok(line) => self.send_line(line),
            Err(MessageError::TooLong) => {
                tracing::warn!(id = self.id, %message, "dropping oversized message");
            }
            Err(e) => {
                tracing::warn!(id = self.id, error = %e, "dropping unencodable message");
            }
        }
    }

    fn send_line(&self, line: String) {
        if self.exceeded.load(Ordering::Relaxed) {
            return;
        }
        match self.outbound.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.exceeded.store(true, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn send_queue_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Relaxed)
    }

    /// Signal both I/O tasks to finish. The write task drains whatever is
    /// already queued first, so a final ERROR still reaches the peer.
    pub fn close(&self) {
        let _ = self.close.send(true);
    }

    pub fn close_receiver(&self) -> watch::Receiver<bool> {
        self.close.subscribe()
    }
}

/// Spawn the read and write tasks for a freshly established stream.
pub fn spawn_io_tasks<S>(stream: S, conn: &Connection, rx: ConnectionRx, events: mpsc::Sender<Event>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let read_closed = conn.close_receiver();

    tokio::spawn(read_task(conn.id, read_half, events.clone(), read_closed));
    tokio::spawn(write_task(conn.id, write_half, rx, events));
}

async fn read_task<R>(
    id: ClientId,
    reader: R,
    events: mpsc::Sender<Event>,
    mut closed: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        if *closed.borrow() {
            return;
        }
        select! {
            _ = closed.changed() => {
                if *closed.borrow() {
                    return;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match Message::parse(&line) {
                        Ok(message) => {
                            if events.send(Event::Message(id, message)).await.is_err() {
                                return;
                            }
                        }
                        Err(MessageError::Empty) => {}
                        Err(e) => {
                            tracing::debug!(id, error = %e, "unparseable line");
                            let _ = events.send(Event::DeadClient(id)).await;
                            return;
                        }
                    },
                    Ok(None) | Err(_) => {
                        let _ = events.send(Event::DeadClient(id)).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn write_task<W>(
    id: ClientId,
    mut writer: W,
    mut rx: ConnectionRx,
    events: mpsc::Sender<Event>,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        if *rx.closed.borrow() {
            // Flush anything the event loop queued before closing.
            while let Ok(line) = rx.outbound.try_recv() {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            break;
        }
        select! {
            _ = rx.closed.changed() => {
                // Flush anything the event loop queued before closing.
                while let Ok(line) = rx.outbound.try_recv() {
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                break;
            }
            line = rx.outbound.recv() => {
                match line {
                    Some(line) => {
                        if writer.write_all(line.as_bytes()).await.is_err() {
                            let _ = events.send(Event::DeadClient(id)).await;
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    tracing::debug!(id, "connection closed");
}
