//! Ping protocol handlers for the event loop.

use crate::runtime::{Handler, Reply};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::time::Duration;

/// Server side: answers every message with the same reply.
#[derive(Debug, Clone)]
pub struct PongResponder {
    reply: Vec<u8>,
}

impl PongResponder {
    pub fn new(reply: impl Into<Vec<u8>>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

impl Default for PongResponder {
    fn default() -> Self {
        Self::new(b"PONG".to_vec())
    }
}

impl Handler for PongResponder {
    fn on_connect(&mut self, _conn_id: usize, _peer: SocketAddr) -> Reply {
        // Servers never initiate.
        Reply::Close
    }

    fn on_message(&mut self, _conn_id: usize, message: &[u8]) -> io::Result<Reply> {
        if message.eq_ignore_ascii_case(b"QUIT") {
            return Ok(Reply::SendThenClose(b"OK".to_vec()));
        }
        Ok(Reply::Send(self.reply.clone()))
    }
}

/// Client side: sends the request, then again after each reply.
///
/// Replies are forwarded to `replies` if set. The sender is dropped when
/// the channel closes, so a receiver iterating over it ends with the
/// conversation.
#[derive(Debug)]
pub struct Pinger {
    request: Vec<u8>,
    delay: Duration,
    /// Replies to collect before closing; 0 means no limit.
    rounds: u64,
    received: u64,
    replies: Option<Sender<Bytes>>,
}

impl Pinger {
    pub fn new(request: impl Into<Vec<u8>>, delay: Duration) -> Self {
        Self {
            request: request.into(),
            delay,
            rounds: 0,
            received: 0,
            replies: None,
        }
    }

    /// Close the connection after `rounds` replies.
    pub fn with_rounds(mut self, rounds: u64) -> Self {
        self.rounds = rounds;
        self
    }

    /// Forward every reply to `replies`.
    pub fn with_replies(mut self, replies: Sender<Bytes>) -> Self {
        self.replies = Some(replies);
        self
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

impl Handler for Pinger {
    fn on_connect(&mut self, _conn_id: usize, _peer: SocketAddr) -> Reply {
        Reply::Send(self.request.clone())
    }

    fn on_message(&mut self, _conn_id: usize, message: &[u8]) -> io::Result<Reply> {
        self.received += 1;
        if let Some(replies) = &self.replies {
            if replies.send(Bytes::copy_from_slice(message)).is_err() {
                self.replies = None;
            }
        }

        if self.rounds > 0 && self.received >= self.rounds {
            return Ok(Reply::Close);
        }
        Ok(Reply::SendAfter(self.request.clone(), self.delay))
    }

    fn on_close(&mut self, _conn_id: usize) {
        self.replies = None;
    }
}
