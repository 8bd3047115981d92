//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread drives every connection. A connection is registered for either
//! readable or writable events, never both: a read that yields data queues a
//! response and flips it to writable, and draining the queue flips it back.
//!
//! Failures are isolated per connection. An I/O error while reading, writing
//! or re-registering one connection closes only that connection. Only errors
//! from the poll itself or from the listener setup escape `run`.

use crate::config::Config;
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry, ReadEvent};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// Single-threaded accept/read/write loop.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry,
    prefix: String,
    poll_timeout: Duration,
}

impl EventLoop {
    /// Bind the listener and register it for accept readiness.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.listen)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            poll_timeout_secs = config.poll_timeout,
            "Server started"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            connections: ConnectionRegistry::new(),
            prefix: config.response_prefix.clone(),
            poll_timeout: config.poll_timeout_duration(),
        })
    }

    #[cfg(test)]
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until the poll itself fails. There is no shutdown path.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once(Some(self.poll_timeout))?;
        }
    }

    /// Wait for readiness once and handle every ready event.
    ///
    /// Returns the number of events handled; zero means the wait timed out.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        if self.events.is_empty() {
            trace!("Poll timed out");
            return Ok(0);
        }

        let Self {
            poll,
            events,
            listener,
            connections,
            prefix,
            ..
        } = self;

        let mut handled = 0;
        for event in events.iter() {
            handled += 1;
            match event.token() {
                LISTENER_TOKEN => accept_connections(listener, poll, connections),
                Token(conn_id) => {
                    // Removed earlier in this batch.
                    if !connections.contains(conn_id) {
                        continue;
                    }

                    if let Err(e) =
                        handle_connection_event(conn_id, event, poll, connections, prefix.as_str())
                    {
                        warn!(conn_id, error = %e, "Connection error");
                        close_connection(poll, connections, conn_id);
                    }
                }
            }
        }

        debug!(ready = handled, "Handled ready events");
        Ok(handled)
    }

    #[cfg(test)]
    fn connection(&self, conn_id: usize) -> Option<&Connection> {
        self.connections.get(conn_id)
    }
}

/// Accept every pending connection.
///
/// mio readiness is edge-triggered, so the listener is drained until it
/// would block rather than accepting a single connection per event.
fn accept_connections(listener: &TcpListener, poll: &Poll, connections: &mut ConnectionRegistry) {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let conn_id = connections.insert(Connection::new(stream, peer_addr));

                let conn = match connections.get_mut(conn_id) {
                    Some(conn) => conn,
                    None => continue,
                };
                if let Err(e) =
                    poll.registry()
                        .register(conn.stream_mut(), Token(conn_id), Interest::READABLE)
                {
                    warn!(peer = %peer_addr, error = %e, "Failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }

                info!(conn_id, peer = %peer_addr, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

fn handle_connection_event(
    conn_id: usize,
    event: &Event,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    prefix: &str,
) -> io::Result<()> {
    if event.is_readable() {
        handle_readable(conn_id, poll, connections, prefix)?;
    }

    // Re-check connection exists (may have been removed)
    if !connections.contains(conn_id) {
        return Ok(());
    }

    if event.is_writable() {
        handle_writable(conn_id, poll, connections)?;
    }

    Ok(())
}

fn handle_readable(
    conn_id: usize,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    prefix: &str,
) -> io::Result<()> {
    let conn = connections
        .get_mut(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    if conn.state() != ConnState::Reading {
        return Ok(());
    }

    match conn.on_readable(prefix)? {
        ReadEvent::Queued => reregister(poll, conn, conn_id)?,
        ReadEvent::Closed => {
            info!(conn_id, peer = %conn.peer(), "Connection closed by peer");
            close_connection(poll, connections, conn_id);
        }
        ReadEvent::Idle => {}
    }

    Ok(())
}

fn handle_writable(
    conn_id: usize,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
) -> io::Result<()> {
    let conn = connections
        .get_mut(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    if conn.state() != ConnState::Writing {
        return Ok(());
    }

    debug!(conn_id, queued = conn.responses().len(), "Draining response queue");
    if conn.flush_responses()? > 0 {
        reregister(poll, conn, conn_id)?;
    }

    Ok(())
}

/// Point the registration at whatever the connection's state wants next.
fn reregister(poll: &Poll, conn: &mut Connection, conn_id: usize) -> io::Result<()> {
    match conn.state().interest() {
        Some(interest) => poll
            .registry()
            .reregister(conn.stream_mut(), Token(conn_id), interest),
        None => Ok(()),
    }
}

fn close_connection(poll: &Poll, connections: &mut ConnectionRegistry, conn_id: usize) {
    if let Some(mut conn) = connections.remove(conn_id) {
        conn.close();
        let _ = poll.registry().deregister(conn.stream_mut());
        debug!(conn_id, remaining = connections.len(), "Connection removed");
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
