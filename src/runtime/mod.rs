//! Readiness-based runtime for the echo server.
//!
//! - `EventLoop`: single-threaded mio loop (epoll on Linux, kqueue on macOS)
//! - `Connection`: per-connection interest state and response queue
//! - `codec`: draining reads, decoding and formatting responses

mod codec;
mod connection;
mod event_loop;

pub(crate) use event_loop::EventLoop;

use crate::config::Config;

/// Bind the listener and run the event loop on the current thread.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut event_loop = EventLoop::bind(&config)?;
    event_loop.run()
}
