//! Connection state machine and per-channel resources.
//!
//! `ConnState` is the single source of truth for a channel: the interest
//! registered with the selector is always `state.interest()`, applied by
//! the event loop after each dispatch.

use crate::runtime::buffer::{ReadBuffer, WriteBuffer};
use crate::runtime::selector::Interest;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Registry, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::SyncSender;
use std::time::Instant;

/// Current state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Server listener. Stays here until the loop exits.
    Listening,
    /// Client socket with a connect in flight.
    Connecting,
    /// Waiting for a complete inbound frame.
    AwaitingRead,
    /// Flushing an outbound frame.
    AwaitingWrite,
    /// Terminal.
    Closed,
}

/// What happened while handling a ready event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The listener accepted zero or more connections.
    Accepted,
    /// The connect finished; the opening frame is queued.
    Connected,
    /// A frame was read and a reply queued.
    Replied,
    /// Read some bytes, no complete frame yet.
    NeedMore,
    /// The queued frame is fully written.
    Flushed,
    /// Part of the queued frame is still pending.
    WritePending,
    /// The peer closed its side.
    Eof,
    /// The handler asked to close.
    Close,
    /// An IO error occurred.
    Failed,
}

impl ConnState {
    /// Interest registered for this state. `None` once closed.
    pub fn interest(self) -> Option<Interest> {
        match self {
            ConnState::Listening => Some(Interest::Accept),
            ConnState::Connecting => Some(Interest::Connect),
            ConnState::AwaitingRead => Some(Interest::Read),
            ConnState::AwaitingWrite => Some(Interest::Write),
            ConnState::Closed => None,
        }
    }

    /// Apply `step`. Returns `None` if the step is not valid in this state.
    pub fn advance(self, step: Step) -> Option<ConnState> {
        use ConnState::*;
        use Step::*;
        match (self, step) {
            (Closed, _) => None,
            (_, Eof | Close | Failed) => Some(Closed),
            (Listening, Accepted) => Some(Listening),
            (Connecting, Connected) => Some(AwaitingWrite),
            (AwaitingRead, Replied) => Some(AwaitingWrite),
            (AwaitingRead, NeedMore) => Some(AwaitingRead),
            (AwaitingWrite, Flushed) => Some(AwaitingRead),
            (AwaitingWrite, WritePending) => Some(AwaitingWrite),
            _ => None,
        }
    }
}

/// The OS socket behind a channel.
#[derive(Debug)]
pub enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Source for Socket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        match self {
            Socket::Listener(l) => registry.register(l, token, interests),
            Socket::Stream(s) => registry.register(s, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        match self {
            Socket::Listener(l) => registry.reregister(l, token, interests),
            Socket::Stream(s) => registry.reregister(s, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Socket::Listener(l) => registry.deregister(l),
            Socket::Stream(s) => registry.deregister(s),
        }
    }
}

/// Why a channel was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection.
    Eof,
    /// The handler ended the conversation.
    Handler,
    /// IO, framing or registration failure.
    Error { kind: io::ErrorKind, message: String },
    /// The event loop is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn from_error(e: &io::Error) -> Self {
        CloseReason::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Completion signal for an in-flight connect.
pub type ConnectSignal = SyncSender<io::Result<SocketAddr>>;

/// A socket owned by one event loop.
#[derive(Debug)]
pub struct Channel {
    socket: Socket,
    state: ConnState,
    peer: Option<SocketAddr>,
    pub(crate) read_buf: ReadBuffer,
    pub(crate) write_buf: WriteBuffer,
    /// Length of the frame being flushed, for reporting.
    pub(crate) frame_len: usize,
    /// Earliest time the queued frame may be written.
    pub(crate) send_after: Option<Instant>,
    /// Close once the queued frame is flushed.
    pub(crate) close_after_write: bool,
    pub(crate) close_reason: Option<CloseReason>,
    pub(crate) connect_signal: Option<ConnectSignal>,
}

impl Channel {
    fn new(socket: Socket, state: ConnState, peer: Option<SocketAddr>, buffer_size: usize) -> Self {
        Self {
            socket,
            state,
            peer,
            read_buf: ReadBuffer::new(buffer_size),
            write_buf: WriteBuffer::new(),
            frame_len: 0,
            send_after: None,
            close_after_write: false,
            close_reason: None,
            connect_signal: None,
        }
    }

    /// A listening socket.
    pub fn listener(listener: TcpListener) -> Self {
        Self::new(Socket::Listener(listener), ConnState::Listening, None, 0)
    }

    /// A connection produced by accept, ready to read the first frame.
    pub fn accepted(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self::new(
            Socket::Stream(stream),
            ConnState::AwaitingRead,
            Some(peer),
            buffer_size,
        )
    }

    /// A client socket with a non-blocking connect in flight.
    pub fn connecting(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self::new(
            Socket::Stream(stream),
            ConnState::Connecting,
            Some(peer),
            buffer_size,
        )
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    pub(crate) fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        match &mut self.socket {
            Socket::Stream(s) => Ok(s),
            Socket::Listener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listener has no stream",
            )),
        }
    }

    pub(crate) fn listener_mut(&mut self) -> io::Result<&mut TcpListener> {
        match &mut self.socket {
            Socket::Listener(l) => Ok(l),
            Socket::Stream(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream is not a listener",
            )),
        }
    }

    /// One non-blocking read into the read buffer. `Ok(0)` is EOF.
    pub(crate) fn fill(&mut self) -> io::Result<usize> {
        match &mut self.socket {
            Socket::Stream(s) => self.read_buf.fill_from(s),
            Socket::Listener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read from a listener",
            )),
        }
    }

    /// One non-blocking write of the pending frame.
    pub(crate) fn flush(&mut self) -> io::Result<usize> {
        match &mut self.socket {
            Socket::Stream(s) => self.write_buf.drain_to(s),
            Socket::Listener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot write to a listener",
            )),
        }
    }

    /// Transition on `step`. Invalid steps are reported as `InvalidData`.
    pub fn advance(&mut self, step: Step) -> io::Result<ConnState> {
        match self.state.advance(step) {
            Some(next) => {
                self.state = next;
                Ok(next)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid transition {:?} on {:?}", step, self.state),
            )),
        }
    }

    /// Close with `reason` unless a reason was already recorded.
    pub(crate) fn close_with(&mut self, reason: CloseReason) {
        self.state = ConnState::Closed;
        self.close_reason.get_or_insert(reason);
    }

    /// Force the terminal state.
    pub fn mark_closed(&mut self) {
        self.state = ConnState::Closed;
    }

    /// Whether the queued frame must wait until later.
    pub(crate) fn deferred_until(&self, now: Instant) -> Option<Instant> {
        self.send_after.filter(|at| *at > now)
    }
}

/// Registry of a loop's channels using slab allocation.
///
/// Slab keys double as selector tokens.
pub struct ChannelRegistry {
    channels: Slab<Channel>,
    max_channels: usize,
}

impl ChannelRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_channels: usize) -> Self {
        Self {
            channels: Slab::with_capacity(max_channels.min(1024)),
            max_channels,
        }
    }

    /// Insert a channel. Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, channel: Channel) -> Option<Token> {
        if self.channels.len() >= self.max_channels {
            return None;
        }
        Some(Token(self.channels.insert(channel)))
    }

    pub fn get(&self, token: Token) -> Option<&Channel> {
        self.channels.get(token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Channel> {
        self.channels.get_mut(token.0)
    }

    pub fn remove(&mut self, token: Token) -> Option<Channel> {
        self.channels.try_remove(token.0)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.channels.contains(token.0)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Tokens of all live channels.
    pub fn tokens(&self) -> Vec<Token> {
        self.channels.iter().map(|(key, _)| Token(key)).collect()
    }
}
