//! Length-prefixed message framing for one stream connection.
//!
//! The framer holds no socket. Reader and writer tasks feed it the bytes they read and report how many bytes they
//! wrote, and it tells its owner which messages arrived and which sends completed or failed. Every message on the
//! wire is a `u32` big-endian length followed by exactly that many payload bytes.

use crate::errors::TransportError;
use log::*;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Prefix a payload with its length.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// A send that was refused before it reached the send queue. The ticket is handed back so the caller can fail it.
#[derive(Debug)]
pub struct SendRejected<T> {
    pub error: TransportError,
    pub ticket: T,
}

/// The outcome of one read: every message it completed, in order, and the error that ends the connection, if any.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    pub messages: Vec<Vec<u8>>,
    pub error: Option<TransportError>,
}

struct OutgoingFrame<T> {
    bytes: Vec<u8>,
    written: usize,
    ticket: T,
}

pub struct WireFramer<T> {
    state: ConnectionState,
    max_message_size: usize,
    read_buf: Vec<u8>,
    send_queue: VecDeque<OutgoingFrame<T>>,
    write_in_flight: Option<usize>,
    last_io: Instant,
    inbound_messages: u64,
}

impl<T> WireFramer<T> {
    pub fn new(max_message_size: usize, connected: bool, now: Instant) -> Self {
        let state = if connected { ConnectionState::Connected } else { ConnectionState::Connecting };
        WireFramer {
            state,
            max_message_size,
            read_buf: Vec::new(),
            send_queue: VecDeque::new(),
            write_in_flight: None,
            last_io: now,
            inbound_messages: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
    }

    pub fn mark_connected(&mut self, now: Instant) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            self.last_io = now;
        }
    }

    /// Queue a payload for sending. Oversize payloads, and any payload offered to a closing connection, are refused
    /// immediately without touching the socket.
    pub fn enqueue(&mut self, payload: &[u8], ticket: T, now: Instant) -> Result<(), SendRejected<T>> {
        if payload.len() > self.max_message_size {
            let error = TransportError::MessageTooLarge { size: payload.len(), max: self.max_message_size };
            return Err(SendRejected { error, ticket });
        }
        if self.is_closing() {
            let error = TransportError::ConnectionClosed("connection is closing".into());
            return Err(SendRejected { error, ticket });
        }
        self.send_queue.push_back(OutgoingFrame { bytes: frame(payload), written: 0, ticket });
        self.last_io = now;
        Ok(())
    }

    /// The next chunk of bytes the writer should put on the socket, if the connection is writable and no other chunk
    /// is outstanding. A partially written message resumes from its unsent remainder.
    pub fn next_write(&mut self) -> Option<Vec<u8>> {
        if self.state != ConnectionState::Connected || self.write_in_flight.is_some() {
            return None;
        }
        let front = self.send_queue.front()?;
        let chunk = front.bytes[front.written..].to_vec();
        self.write_in_flight = Some(chunk.len());
        Some(chunk)
    }

    /// Record that the writer put `n` bytes of the outstanding chunk on the socket. Returns the tickets of the
    /// messages that are now fully sent.
    pub fn on_bytes_written(&mut self, n: usize, now: Instant) -> Vec<T> {
        let mut completed = Vec::new();
        let Some(in_flight) = self.write_in_flight.take() else {
            warn!("Write completion reported with no write in flight");
            return completed;
        };
        if n > in_flight {
            warn!("Writer reported {n} bytes written for a chunk of {in_flight} bytes");
        }
        self.last_io = now;
        if let Some(front) = self.send_queue.front_mut() {
            front.written = (front.written + n.min(in_flight)).min(front.bytes.len());
            if front.written == front.bytes.len() {
                if let Some(done) = self.send_queue.pop_front() {
                    completed.push(done.ticket);
                }
            }
        }
        completed
    }

    /// Feed raw bytes read from the socket and return every complete message they finish. An oversize length prefix
    /// puts the connection into the closing state and is reported after the messages that preceded it. The owner
    /// must then call [`Self::close`].
    pub fn on_bytes_received(&mut self, buf: &[u8], now: Instant) -> Received {
        let mut received = Received::default();
        if self.is_closing() {
            return received;
        }
        self.last_io = now;
        self.read_buf.extend_from_slice(buf);
        loop {
            if self.read_buf.len() < LENGTH_PREFIX_SIZE {
                break;
            }
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            prefix.copy_from_slice(&self.read_buf[..LENGTH_PREFIX_SIZE]);
            let len = u32::from_be_bytes(prefix) as usize;
            if len > self.max_message_size {
                warn!("Incoming message of {len} bytes exceeds the maximum of {}. Closing.", self.max_message_size);
                self.state = ConnectionState::Closing;
                self.read_buf.clear();
                received.error = Some(TransportError::MessageTooLarge { size: len, max: self.max_message_size });
                break;
            }
            if self.read_buf.len() < LENGTH_PREFIX_SIZE + len {
                break;
            }
            let rest = self.read_buf.split_off(LENGTH_PREFIX_SIZE + len);
            let mut msg = std::mem::replace(&mut self.read_buf, rest);
            msg.drain(..LENGTH_PREFIX_SIZE);
            self.inbound_messages += 1;
            received.messages.push(msg);
        }
        received
    }

    /// Close the connection, returning the tickets of every send that had not completed. Calling this more than once
    /// returns nothing the second time.
    pub fn close(&mut self) -> Vec<T> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        self.state = ConnectionState::Closing;
        self.write_in_flight = None;
        self.read_buf.clear();
        let failed = self.send_queue.drain(..).map(|f| f.ticket).collect();
        self.state = ConnectionState::Closed;
        failed
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.send_queue.is_empty()
    }

    pub fn last_io(&self) -> Instant {
        self.last_io
    }

    pub fn inbound_messages(&self) -> u64 {
        self.inbound_messages
    }

    /// Mid-message in either direction, and not silent for longer than `timeout`.
    pub fn is_busy(&self, timeout: Duration, now: Instant) -> bool {
        let mid_message = !self.read_buf.is_empty() || !self.send_queue.is_empty();
        mid_message && now.saturating_duration_since(self.last_io) < timeout
    }

    /// No traffic for at least `timeout`.
    pub fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_io) >= timeout
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn framer() -> WireFramer<u32> {
        WireFramer::new(1024, true, Instant::now())
    }

    #[test]
    fn byte_by_byte_delivery() {
        let mut f = framer();
        let wire = frame(b"hello world");
        let now = Instant::now();
        let mut out = Vec::new();
        for b in &wire {
            out.extend(f.on_bytes_received(&[*b], now).messages);
        }
        assert_eq!(out, vec![b"hello world".to_vec()]);
        assert_eq!(f.inbound_messages(), 1);
    }

    #[test]
    fn arbitrary_chunk_boundaries() {
        let now = Instant::now();
        let payloads: Vec<Vec<u8>> = vec![b"a".to_vec(), Vec::new(), vec![7u8; 300], b"last one".to_vec()];
        let wire: Vec<u8> = payloads.iter().flat_map(|p| frame(p)).collect();
        for chunk_size in [1usize, 3, 5, 64, 1000] {
            let mut f = framer();
            let mut out = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                out.extend(f.on_bytes_received(chunk, now).messages);
            }
            assert_eq!(out, payloads, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn oversize_receive_closes_without_emitting() {
        let mut f = framer();
        let now = Instant::now();
        f.enqueue(b"queued", 1, now).expect("enqueue");
        let mut wire = frame(&vec![0u8; 1025]);
        wire.truncate(10);
        let received = f.on_bytes_received(&wire, now);
        assert!(received.messages.is_empty());
        assert_eq!(received.error, Some(TransportError::MessageTooLarge { size: 1025, max: 1024 }));
        assert_eq!(f.state(), ConnectionState::Closing);
        assert_eq!(f.on_bytes_received(&frame(b"late"), now), Received::default());
        assert_eq!(f.close(), vec![1]);
        assert_eq!(f.state(), ConnectionState::Closed);
    }

    #[test]
    fn messages_before_an_oversize_prefix_are_delivered() {
        let mut f = framer();
        let mut wire = frame(b"good");
        wire.extend_from_slice(&4096u32.to_be_bytes());
        let received = f.on_bytes_received(&wire, Instant::now());
        assert_eq!(received.messages, vec![b"good".to_vec()]);
        assert_eq!(received.error, Some(TransportError::MessageTooLarge { size: 4096, max: 1024 }));
        assert_eq!(f.inbound_messages(), 1);
        assert!(f.is_closing());
    }

    #[test]
    fn oversize_send_fails_fast() {
        let mut f = framer();
        let rejected = f.enqueue(&vec![0u8; 2000], 9, Instant::now()).expect_err("too large");
        assert_eq!(rejected.ticket, 9);
        assert!(matches!(rejected.error, TransportError::MessageTooLarge { size: 2000, .. }));
        assert!(!f.has_pending_sends());
        assert!(f.next_write().is_none());
    }

    #[test]
    fn partial_writes_resume() {
        let mut f = framer();
        let now = Instant::now();
        f.enqueue(b"abcdef", 1, now).expect("enqueue");
        f.enqueue(b"gh", 2, now).expect("enqueue");
        let chunk = f.next_write().expect("chunk");
        assert_eq!(chunk, frame(b"abcdef"));
        assert!(f.next_write().is_none(), "only one chunk in flight");
        assert!(f.on_bytes_written(5, now).is_empty());
        let rest = f.next_write().expect("remainder");
        assert_eq!(rest, b"bcdef".to_vec());
        assert_eq!(f.on_bytes_written(5, now), vec![1]);
        assert_eq!(f.next_write().expect("second message"), frame(b"gh"));
        assert_eq!(f.on_bytes_written(6, now), vec![2]);
        assert!(f.next_write().is_none());
    }

    #[test]
    fn connecting_holds_writes_and_close_fails_each_ticket_once() {
        let now = Instant::now();
        let mut f: WireFramer<u32> = WireFramer::new(1024, false, now);
        f.enqueue(b"one", 1, now).expect("enqueue");
        f.enqueue(b"two", 2, now).expect("enqueue");
        assert!(f.next_write().is_none());
        f.mark_connected(now);
        assert!(f.next_write().is_some());
        assert_eq!(f.close(), vec![1, 2]);
        assert!(f.close().is_empty());
        assert!(f.enqueue(b"three", 3, now).is_err());
    }

    #[test]
    fn busy_and_idle() {
        let t0 = Instant::now();
        let timeout = Duration::from_secs(60);
        let mut f = framer();
        assert!(!f.is_busy(timeout, t0));
        assert!(f.on_bytes_received(&frame(b"partial")[..5], t0).messages.is_empty());
        assert!(f.is_busy(timeout, t0 + Duration::from_secs(10)));
        assert!(!f.is_busy(timeout, t0 + Duration::from_secs(61)));
        assert!(f.is_idle(timeout, t0 + Duration::from_secs(61)));
    }
}
