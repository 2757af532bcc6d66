//! Payload handling hook.
//!
//! The event loop owns framing and the READ/WRITE alternation; a `Handler`
//! only decides what to answer. Every complete inbound frame gets exactly
//! one `Reply`.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Answer to a frame (or to a completed connect).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Queue this message for writing.
    Send(Vec<u8>),
    /// Queue this message, but do not write it before `delay` has passed.
    SendAfter(Vec<u8>, Duration),
    /// Write this message, then close the channel.
    SendThenClose(Vec<u8>),
    /// Close the channel without writing.
    Close,
}

/// Per-loop payload policy. Called only from the loop thread.
pub trait Handler: Send {
    /// A client connect completed. The reply becomes the opening frame.
    fn on_connect(&mut self, conn_id: usize, peer: SocketAddr) -> Reply;

    /// A complete frame arrived. An error closes only this channel.
    fn on_message(&mut self, conn_id: usize, message: &[u8]) -> io::Result<Reply>;

    /// A listener accepted a new connection.
    fn on_accept(&mut self, _conn_id: usize, _peer: SocketAddr) {}

    /// The channel was closed and released.
    fn on_close(&mut self, _conn_id: usize) {}
}
