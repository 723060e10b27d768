//! TCP connections and the tasks that move their bytes.
//!
//! Every connection has a reader task and a writer task. Neither touches protocol state: they report what happened as
//! [`IoEvent`]s to the event loop, which owns the [`Connection`] and its framer.

use crate::framer::{Received, SendRejected, WireFramer};
use crate::identity::PeerId;
use crate::message_types::IoEvent;
use crate::pool::{ConnId, PooledConnection};
use futures::channel::mpsc::UnboundedSender;
use log::*;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc as chunks;
use tokio::task::JoinHandle;

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub struct Connection<T> {
    id: ConnId,
    remote: String,
    inbound: bool,
    framer: WireFramer<T>,
    writer: Option<chunks::UnboundedSender<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    close_when_drained: bool,
}

impl<T> Connection<T> {
    /// A connection we are still dialling. Sends queue up until [`Self::attach`] is called.
    pub fn connecting(id: ConnId, remote: String, max_message_size: usize, now: Instant) -> Self {
        Connection {
            id,
            remote,
            inbound: false,
            framer: WireFramer::new(max_message_size, false, now),
            writer: None,
            reader: None,
            close_when_drained: false,
        }
    }

    pub fn accepted(
        id: ConnId,
        stream: TcpStream,
        remote: SocketAddr,
        max_message_size: usize,
        events: UnboundedSender<IoEvent>,
        now: Instant,
    ) -> Self {
        let mut conn = Connection::connecting(id, remote.to_string(), max_message_size, now);
        conn.inbound = true;
        conn.attach(stream, events, now);
        conn
    }

    /// Hand the connection its socket and start moving bytes.
    pub fn attach(&mut self, stream: TcpStream, events: UnboundedSender<IoEvent>, now: Instant) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {self}: {e}");
        }
        let (read, write) = stream.into_split();
        let (chunk_sender, chunk_receiver) = chunks::unbounded_channel();
        tokio::spawn(write_loop(self.id, write, chunk_receiver, events.clone()));
        self.reader = Some(tokio::spawn(read_loop(self.id, read, events)));
        self.writer = Some(chunk_sender);
        self.framer.mark_connected(now);
        self.pump();
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn send(&mut self, payload: &[u8], ticket: T, now: Instant) -> Result<(), SendRejected<T>> {
        self.framer.enqueue(payload, ticket, now)?;
        self.pump();
        Ok(())
    }

    /// Close once every queued message has been written.
    pub fn close_when_drained(&mut self) {
        self.close_when_drained = true;
    }

    /// Whether the connection asked to be closed and has nothing left to write.
    pub fn is_drained(&self) -> bool {
        self.close_when_drained && !self.framer.has_pending_sends()
    }

    /// The writer finished a chunk. Returns the tickets of the sends it completed.
    pub fn on_written(&mut self, n: usize, now: Instant) -> Vec<T> {
        let done = self.framer.on_bytes_written(n, now);
        self.pump();
        done
    }

    pub fn on_received(&mut self, bytes: &[u8], now: Instant) -> Received {
        self.framer.on_bytes_received(bytes, now)
    }

    /// Stop both tasks. Returns the tickets of every send that did not complete.
    pub fn close(&mut self) -> Vec<T> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // Dropping the sender ends the writer task, which shuts the socket down.
        self.writer = None;
        self.framer.close()
    }

    fn pump(&mut self) {
        let Some(writer) = &self.writer else {
            return;
        };
        if let Some(chunk) = self.framer.next_write() {
            if writer.send(chunk).is_err() {
                // The writer task is gone, and its close event is on the way.
                trace!("Writer for {self} has already stopped");
            }
        }
    }
}

impl<T> Display for Connection<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let direction = if self.inbound { "from" } else { "to" };
        write!(f, "connection #{} {direction} {}", self.id, self.remote)
    }
}

impl<T> PooledConnection for Connection<T> {
    fn conn_id(&self) -> ConnId {
        self.id
    }

    fn is_closing(&self) -> bool {
        self.framer.is_closing()
    }

    fn is_busy(&self, timeout: Duration, now: Instant) -> bool {
        self.framer.is_busy(timeout, now)
    }

    fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        self.framer.is_idle(timeout, now)
    }

    fn last_io(&self) -> Instant {
        self.framer.last_io()
    }

    fn inbound_messages(&self) -> u64 {
        self.framer.inbound_messages()
    }
}

impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(conn: ConnId, mut read: OwnedReadHalf, events: UnboundedSender<IoEvent>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        match read.read(&mut buf).await {
            Ok(0) => break "closed by peer".to_string(),
            Ok(n) => {
                if events.unbounded_send(IoEvent::Received { conn, bytes: buf[..n].to_vec() }).is_err() {
                    return;
                }
            }
            Err(e) => break e.to_string(),
        }
    };
    let _ = events.unbounded_send(IoEvent::Closed { conn, reason });
}

async fn write_loop(
    conn: ConnId,
    mut write: OwnedWriteHalf,
    mut chunks: chunks::UnboundedReceiver<Vec<u8>>,
    events: UnboundedSender<IoEvent>,
) {
    while let Some(chunk) = chunks.recv().await {
        match write.write(&chunk).await {
            Ok(0) => {
                let _ = events.unbounded_send(IoEvent::Closed { conn, reason: "write returned zero".into() });
                return;
            }
            Ok(n) => {
                if events.unbounded_send(IoEvent::Written { conn, n }).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.unbounded_send(IoEvent::Closed { conn, reason: e.to_string() });
                return;
            }
        }
    }
    if let Err(e) = write.shutdown().await {
        trace!("Shutting down connection #{conn}: {e}");
    }
}

/// Dial `host:port` in the background. The outcome arrives as [`IoEvent::Connected`] or [`IoEvent::ConnectFailed`].
pub fn spawn_connect(conn: ConnId, host: String, port: u16, timeout: Duration, events: UnboundedSender<IoEvent>) {
    tokio::spawn(async move {
        let event = match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(stream)) => IoEvent::Connected { conn, stream },
            Ok(Err(e)) => IoEvent::ConnectFailed { conn, reason: format!("{host}:{port}: {e}") },
            Err(_) => IoEvent::ConnectFailed { conn, reason: format!("{host}:{port}: timed out") },
        };
        let _ = events.unbounded_send(event);
    });
}

/// Accept connections until the task is aborted or the event loop goes away.
pub fn spawn_accept(listener: TcpListener, events: UnboundedSender<IoEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    trace!("Accepted connection from {remote}");
                    if events.unbounded_send(IoEvent::Accepted { stream, remote }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Error accepting connection: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

/// Bind the listening socket. `port` comes from the configuration or is derived from the node id; unless `picky`,
/// a busy port falls back to one chosen by the operating system.
pub async fn bind(host: &str, port: u16, picky: bool) -> std::io::Result<TcpListener> {
    match TcpListener::bind((host, port)).await {
        Ok(listener) => Ok(listener),
        Err(e) if !picky => {
            debug!("Port {port} is not available ({e}). Letting the system choose one.");
            TcpListener::bind((host, 0)).await
        }
        Err(e) => Err(e),
    }
}

/// A listening port in `[1026, 32766]` derived from the node id, so a node tends to keep its port across restarts.
pub fn derived_port(id: &PeerId) -> u16 {
    let bytes = id.as_bytes();
    let n = u16::from_be_bytes([bytes[0], bytes[1]]);
    1026 + n % (32766 - 1026 + 1)
}
