//! Per-connection state for the event loop.
//!
//! Each connection owns its socket, the interest it is currently registered
//! with, and the queue of responses waiting to be written.

use crate::runtime::codec::{self, ReadOutcome};
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::info;

/// Current state of a connection.
///
/// A live connection is registered for exactly one of read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered for readable events.
    Reading,
    /// Registered for writable events with responses queued.
    Writing,
    /// Deregistered. Terminal.
    Closed,
}

impl ConnState {
    /// Interest this state should be registered with, if any.
    pub fn interest(self) -> Option<Interest> {
        match self {
            ConnState::Reading => Some(Interest::READABLE),
            ConnState::Writing => Some(Interest::WRITABLE),
            ConnState::Closed => None,
        }
    }
}

/// What a readable event did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// A response was queued; the connection now wants to write.
    Queued,
    /// Peer closed with nothing pending; the connection must be dropped.
    Closed,
    /// Nothing was available.
    Idle,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    /// Pending outbound responses in insertion order.
    responses: Vec<String>,
    read_buf: BytesMut,
}

impl<S> Connection<S> {
    /// Create a new connection in initial reading state with an empty queue.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            responses: Vec::new(),
            read_buf: BytesMut::with_capacity(codec::READ_CHUNK_SIZE),
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn responses(&self) -> &[String] {
        &self.responses
    }

    /// Append a response and switch to writing.
    pub fn queue_response(&mut self, response: String) {
        self.responses.push(response);
        self.state = ConnState::Writing;
    }

    /// Mark connection as closed.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }
}

impl<S: Read> Connection<S> {
    /// Drain the socket and queue one response for whatever arrived.
    pub fn on_readable(&mut self, prefix: &str) -> io::Result<ReadEvent> {
        self.read_buf.clear();

        let outcome =
            codec::read_available(&mut self.stream, &mut self.read_buf, codec::MAX_MESSAGE_SIZE)?;

        match outcome {
            ReadOutcome::Closed => {
                self.close();
                Ok(ReadEvent::Closed)
            }
            ReadOutcome::Empty => Ok(ReadEvent::Idle),
            // Bytes past the limit and a pending EOF are seen again on the
            // next readable event.
            ReadOutcome::Data { len, eof } => {
                let content = codec::decode(&self.read_buf);
                self.read_buf.clear();
                info!(peer = %self.peer, bytes = len, eof, content = %content, "Read data");
                self.queue_response(codec::format_response(prefix, &content));
                Ok(ReadEvent::Queued)
            }
        }
    }
}

impl<S: Write> Connection<S> {
    /// Write every queued response in order, then switch back to reading.
    ///
    /// Returns the number of responses written. An empty queue is a no-op
    /// and leaves the state untouched.
    pub fn flush_responses(&mut self) -> io::Result<usize> {
        if self.responses.is_empty() {
            return Ok(0);
        }

        for response in &self.responses {
            info!(peer = %self.peer, content = %response, "Write data");
            codec::write_response(&mut self.stream, response)?;
        }

        let written = self.responses.len();
        self.responses.clear();
        self.state = ConnState::Reading;
        Ok(written)
    }
}

/// Registry of active connections using slab allocation.
///
/// The slab key doubles as the mio token for the connection.
pub struct ConnectionRegistry<S = TcpStream> {
    connections: Slab<Connection<S>>,
}

impl<S> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
        }
    }

    /// Insert a new connection, returning its id.
    pub fn insert(&mut self, conn: Connection<S>) -> usize {
        self.connections.insert(conn)
    }

    #[cfg(test)]
    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
