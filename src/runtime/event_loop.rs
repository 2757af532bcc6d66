//! Event loop driver.
//!
//! One loop owns one `Selector` and every channel registered with it, and
//! runs on its own thread. Each iteration waits for readiness, dispatches
//! the whole ready batch according to each channel's `ConnState`, and then
//! re-registers the interest the new state implies. A failure on one
//! channel closes that channel only.

use crate::config::Config;
use crate::runtime::connection::{Channel, ChannelRegistry, CloseReason, ConnState, Step};
use crate::runtime::framing::{Decoded, Framing};
use crate::runtime::handler::{Handler, Reply};
use crate::runtime::observer::{LoopEvent, Observer};
use crate::runtime::selector::{Interest, ReadyEvent, RegistrationError, Selector};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Settings for one event loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Role name, used for the thread name and logs.
    pub name: String,
    /// Read buffer size per channel.
    pub buffer_size: usize,
    /// Ready events taken per `wait`.
    pub event_capacity: usize,
    pub framing: Framing,
    /// Channels (including listeners) one loop will hold.
    pub max_channels: usize,
    /// Listen backlog for `listen`.
    pub backlog: i32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "event".to_string(),
            buffer_size: 1024,
            event_capacity: 128,
            framing: Framing::default(),
            max_channels: 1024,
            backlog: 1024,
        }
    }
}

impl LoopConfig {
    pub fn from_config(config: &Config, name: &str) -> Self {
        Self {
            name: name.to_string(),
            buffer_size: config.buffer_size,
            event_capacity: config.event_capacity,
            framing: config.framing,
            ..Self::default()
        }
    }
}

/// How long a listener stays parked after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What the loop does with a channel after dispatching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    /// Apply the interest of the (possibly new) state.
    Rearm,
    /// Leave disarmed until the given time.
    Park(Instant),
}

/// A readiness-driven loop over a set of channels.
pub struct EventLoop {
    config: LoopConfig,
    selector: Selector,
    channels: ChannelRegistry,
    handler: Box<dyn Handler>,
    observer: Arc<dyn Observer>,
    stop: Arc<AtomicBool>,
    /// Parked channels and when they are due.
    deferred: Vec<(Instant, Token)>,
}

impl EventLoop {
    /// Open the selector. Fails only if the OS poller cannot be created.
    pub fn new<H>(config: LoopConfig, handler: H, observer: Arc<dyn Observer>) -> io::Result<Self>
    where
        H: Handler + 'static,
    {
        let selector = Selector::new(config.event_capacity)?;
        let channels = ChannelRegistry::new(config.max_channels);
        Ok(Self {
            config,
            selector,
            channels,
            handler: Box::new(handler),
            observer,
            stop: Arc::new(AtomicBool::new(false)),
            deferred: Vec::new(),
        })
    }

    /// Bind a listener and register it for accepts.
    ///
    /// The socket is listening when this returns, so clients may connect
    /// before the loop starts running.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<(Token, SocketAddr)> {
        let listener = create_listener(addr, self.config.backlog)?;
        let local_addr = listener.local_addr()?;
        let listener = TcpListener::from_std(listener);

        let token = self
            .channels
            .insert(Channel::listener(listener))
            .ok_or_else(channel_limit)?;
        if let Err(e) = self.arm(token) {
            self.channels.remove(token);
            return Err(e.into());
        }

        self.observer.observe(&LoopEvent::Listening {
            conn_id: token.0,
            addr: local_addr,
        });
        Ok((token, local_addr))
    }

    /// Start a non-blocking connect and register it.
    ///
    /// The receiver gets exactly one message: the peer address once the
    /// connect completes, or the error that closed the channel first.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
    ) -> io::Result<(Token, Receiver<io::Result<SocketAddr>>)> {
        let stream = TcpStream::connect(addr)?;
        let mut channel = Channel::connecting(stream, addr, self.config.buffer_size);
        let (tx, rx) = mpsc::sync_channel(1);
        channel.connect_signal = Some(tx);

        let token = self.channels.insert(channel).ok_or_else(channel_limit)?;
        if let Err(e) = self.arm(token) {
            self.channels.remove(token);
            return Err(e.into());
        }
        Ok((token, rx))
    }

    /// Number of live channels, listeners included.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Spawn the loop on a dedicated thread named `<name>-loop`.
    pub fn start(self) -> io::Result<LoopHandle> {
        let name = format!("{}-loop", self.config.name);
        let stop = Arc::clone(&self.stop);
        let waker = self.selector.waker();

        let mut event_loop = self;
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || event_loop.run())?;

        Ok(LoopHandle {
            name,
            stop,
            waker,
            thread: Some(thread),
        })
    }

    /// Run until the stop flag is set, then close every channel.
    pub fn run(&mut self) -> io::Result<()> {
        let result = loop {
            if self.stop.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(e) = self.turn(None) {
                break Err(e);
            }
        };
        self.shutdown();
        result
    }

    /// One iteration: wait (at most `timeout`, less if a deferred write
    /// falls due sooner), then dispatch every ready event.
    ///
    /// Returns the number of events dispatched.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = self.wait_bound(timeout, Instant::now());
        let ready = self.selector.wait(timeout)?;

        for event in &ready {
            self.dispatch(*event);
        }

        self.release_deferred(Instant::now());
        Ok(ready.len())
    }

    fn wait_bound(&self, timeout: Option<Duration>, now: Instant) -> Option<Duration> {
        let next_due = self
            .deferred
            .iter()
            .map(|(at, _)| at.saturating_duration_since(now))
            .min();
        match (timeout, next_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dispatch(&mut self, event: ReadyEvent) {
        let token = event.token;
        let Some(state) = self.channels.get(token).map(Channel::state) else {
            return;
        };

        let result = match state {
            ConnState::Listening => self.handle_acceptable(token),
            ConnState::Connecting => self.handle_connectable(token, event),
            ConnState::AwaitingRead => self.handle_readable(token),
            ConnState::AwaitingWrite => self.handle_writable(token),
            ConnState::Closed => Ok(Next::Rearm),
        };
        self.apply(token, result);
    }

    fn apply(&mut self, token: Token, result: io::Result<Next>) {
        match result {
            Ok(Next::Rearm) => self.settle(token),
            Ok(Next::Park(at)) => self.deferred.push((at, token)),
            Err(e) => {
                let peer = self.channels.get(token).and_then(Channel::peer);
                debug!(conn_id = token.0, peer = ?peer, error = %e, "Channel error");
                self.close(token, CloseReason::from_error(&e));
            }
        }
    }

    /// Derive the registration from the channel's state, or release it.
    fn settle(&mut self, token: Token) {
        let Some(channel) = self.channels.get_mut(token) else {
            return;
        };

        if channel.state() == ConnState::Closed {
            let reason = channel.close_reason.take().unwrap_or(CloseReason::Handler);
            self.close(token, reason);
        } else if let Err(e) = self.arm(token) {
            let e = io::Error::from(e);
            self.close(token, CloseReason::from_error(&e));
        }
    }

    fn arm(&mut self, token: Token) -> Result<(), RegistrationError> {
        let Some(channel) = self.channels.get_mut(token) else {
            return Ok(());
        };
        let interest = channel
            .state()
            .interest()
            .ok_or(RegistrationError::Closed(token))?;
        self.selector.register(token, channel, interest)?;

        // A frame already sitting in the buffer will not produce an OS event.
        if interest == Interest::Read && has_buffered_frame(self.config.framing, channel) {
            self.selector.mark_ready(token);
        }
        Ok(())
    }

    fn release_deferred(&mut self, now: Instant) {
        if self.deferred.is_empty() {
            return;
        }
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.deferred.drain(..).partition(|(at, _)| *at <= now);
        self.deferred = waiting;

        for (_, token) in due {
            if let Some(channel) = self.channels.get_mut(token) {
                channel.send_after = None;
                self.settle(token);
            }
        }
    }

    fn handle_acceptable(&mut self, token: Token) -> io::Result<Next> {
        let mut next = Next::Rearm;
        loop {
            let listener = self
                .channels
                .get_mut(token)
                .ok_or_else(not_found)?
                .listener_mut()?;

            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The pending connection is reported again as soon as the
                    // listener is re-armed, so hold it back for a while.
                    warn!(conn_id = token.0, error = %e, "Accept error");
                    next = Next::Park(Instant::now() + ACCEPT_BACKOFF);
                    break;
                }
            }
        }

        self.channels
            .get_mut(token)
            .ok_or_else(not_found)?
            .advance(Step::Accepted)?;
        Ok(next)
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let channel = Channel::accepted(stream, peer, self.config.buffer_size);
        let Some(token) = self.channels.insert(channel) else {
            warn!(peer = %peer, "Channel limit reached, dropping connection");
            return;
        };

        if let Err(e) = self.arm(token) {
            let e = io::Error::from(e);
            self.close(token, CloseReason::from_error(&e));
            return;
        }

        self.handler.on_accept(token.0, peer);
        self.observer.observe(&LoopEvent::Accepted {
            conn_id: token.0,
            peer,
        });
    }

    fn handle_connectable(&mut self, token: Token, event: ReadyEvent) -> io::Result<Next> {
        let framing = self.config.framing;
        let channel = self.channels.get_mut(token).ok_or_else(not_found)?;
        let stream = channel.stream_mut()?;

        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {
                if event.error || event.hangup {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "connect failed",
                    ));
                }
                // Spurious wake-up, still in progress.
                return Ok(Next::Rearm);
            }
            Err(e) => return Err(e),
        };

        channel.advance(Step::Connected)?;
        if let Some(signal) = channel.connect_signal.take() {
            let _ = signal.try_send(Ok(peer));
        }
        self.observer.observe(&LoopEvent::Connected {
            conn_id: token.0,
            peer,
        });

        let reply = self.handler.on_connect(token.0, peer);
        if queue_reply(channel, reply, framing) == Step::Close {
            channel.advance(Step::Close)?;
            channel.close_with(CloseReason::Handler);
        }
        Ok(Next::Rearm)
    }

    fn handle_readable(&mut self, token: Token) -> io::Result<Next> {
        let framing = self.config.framing;
        let channel = self.channels.get_mut(token).ok_or_else(not_found)?;

        if !has_buffered_frame(framing, channel) {
            match channel.fill() {
                Ok(0) => {
                    channel.advance(Step::Eof)?;
                    channel.close_with(CloseReason::Eof);
                    return Ok(Next::Rearm);
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Next::Rearm),
                Err(e) => return Err(e),
            }
        }

        let limit = channel.read_buf.limit();
        let (message, consumed) = match framing.decode(channel.read_buf.as_slice(), limit) {
            Ok(Decoded::Complete { message, consumed }) => {
                (Bytes::copy_from_slice(message), consumed)
            }
            Ok(Decoded::Incomplete) => {
                channel.advance(Step::NeedMore)?;
                return Ok(Next::Rearm);
            }
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };
        channel.read_buf.consume(consumed);

        self.observer.observe(&LoopEvent::Received {
            conn_id: token.0,
            message: message.clone(),
        });

        let reply = self.handler.on_message(token.0, &message)?;
        let step = queue_reply(channel, reply, framing);
        channel.advance(step)?;
        if step == Step::Close {
            channel.close_with(CloseReason::Handler);
        }
        Ok(Next::Rearm)
    }

    fn handle_writable(&mut self, token: Token) -> io::Result<Next> {
        let channel = self.channels.get_mut(token).ok_or_else(not_found)?;

        if let Some(at) = channel.deferred_until(Instant::now()) {
            return Ok(Next::Park(at));
        }
        channel.send_after = None;

        match channel.flush() {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Next::Rearm),
            Err(e) => return Err(e),
        }

        if !channel.write_buf.is_empty() {
            channel.advance(Step::WritePending)?;
            return Ok(Next::Rearm);
        }

        channel.advance(Step::Flushed)?;
        self.observer.observe(&LoopEvent::Sent {
            conn_id: token.0,
            bytes: channel.frame_len,
        });

        if channel.close_after_write {
            channel.advance(Step::Close)?;
            channel.close_with(CloseReason::Handler);
        }
        Ok(Next::Rearm)
    }

    /// Deregister, drop the socket, and report. Unknown tokens are ignored.
    fn close(&mut self, token: Token, reason: CloseReason) {
        let Some(mut channel) = self.channels.remove(token) else {
            return;
        };

        if let Err(e) = self.selector.deregister(token, &mut channel) {
            debug!(conn_id = token.0, error = %e, "Deregister failed");
        }
        channel.mark_closed();
        self.deferred.retain(|(_, t)| *t != token);

        if let Some(signal) = channel.connect_signal.take() {
            let _ = signal.try_send(Err(reason_to_error(&reason)));
        }
        drop(channel);

        self.handler.on_close(token.0);
        self.observer.observe(&LoopEvent::Closed {
            conn_id: token.0,
            reason,
        });
    }

    fn shutdown(&mut self) {
        for token in self.channels.tokens() {
            self.close(token, CloseReason::Shutdown);
        }
        self.observer.observe(&LoopEvent::Stopped);
    }
}

/// Handle to a loop running on its own thread.
///
/// Dropping the handle stops the loop and joins it.
pub struct LoopHandle {
    name: String,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl LoopHandle {
    /// Ask the loop to exit after its current batch, interrupting `wait`.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(thread = %self.name, error = %e, "Failed to wake event loop");
        }
    }

    /// Stop the loop and wait for it to close its channels.
    pub fn stop(mut self) -> io::Result<()> {
        self.signal_stop();
        self.join_thread()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn join_thread(&mut self) -> io::Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} thread panicked", self.name),
                )
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.signal_stop();
            if let Err(e) = self.join_thread() {
                warn!(thread = %self.name, error = %e, "Event loop exited with error");
            }
        }
    }
}

/// Queue the handler's reply on `channel`, returning the resulting step.
///
/// `Step::Close` leaves the channel untouched; the caller applies it.
fn queue_reply(channel: &mut Channel, reply: Reply, framing: Framing) -> Step {
    let (message, delay, close_after_write) = match reply {
        Reply::Send(message) => (message, None, false),
        Reply::SendAfter(message, delay) => (message, Some(delay), false),
        Reply::SendThenClose(message) => (message, None, true),
        Reply::Close => return Step::Close,
    };

    channel.write_buf.clear();
    framing.encode(&message, channel.write_buf.as_mut());
    channel.frame_len = channel.write_buf.len();
    channel.send_after = delay
        .filter(|d| !d.is_zero())
        .map(|d| Instant::now() + d);
    channel.close_after_write = close_after_write;
    Step::Replied
}

fn has_buffered_frame(framing: Framing, channel: &Channel) -> bool {
    let buf = &channel.read_buf;
    !buf.is_empty() && !matches!(framing.decode(buf.as_slice(), buf.limit()), Ok(Decoded::Incomplete))
}

fn reason_to_error(reason: &CloseReason) -> io::Error {
    match reason {
        CloseReason::Error { kind, message } => io::Error::new(*kind, message.clone()),
        CloseReason::Shutdown => io::Error::new(io::ErrorKind::Interrupted, "event loop stopped"),
        CloseReason::Eof | CloseReason::Handler => {
            io::Error::new(io::ErrorKind::ConnectionAborted, "channel closed")
        }
    }
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "channel not found")
}

fn channel_limit() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "channel limit reached")
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
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
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::observer::RecordingObserver;
    use std::collections::HashSet;
    use std::io::{Read, Write};

    const WAIT: Duration = Duration::from_secs(5);

    /// PONG to everything; fails on BOOM, delays SLOW, closes on QUIT.
    struct TestResponder;

    impl Handler for TestResponder {
        fn on_connect(&mut self, _conn_id: usize, _peer: SocketAddr) -> Reply {
            Reply::Send(b"PING".to_vec())
        }

        fn on_message(&mut self, _conn_id: usize, message: &[u8]) -> io::Result<Reply> {
            match message {
                b"BOOM" => Err(io::Error::new(io::ErrorKind::Other, "injected failure")),
                b"SLOW" => Ok(Reply::SendAfter(b"LATE".to_vec(), Duration::from_millis(300))),
                b"QUIT" => Ok(Reply::SendThenClose(b"OK".to_vec())),
                _ => Ok(Reply::Send(b"PONG".to_vec())),
            }
        }
    }

    /// Ends every conversation as soon as it can.
    struct Closer;

    impl Handler for Closer {
        fn on_connect(&mut self, _conn_id: usize, _peer: SocketAddr) -> Reply {
            Reply::Close
        }

        fn on_message(&mut self, _conn_id: usize, _message: &[u8]) -> io::Result<Reply> {
            Ok(Reply::Close)
        }
    }

    fn close_reasons(events: &[LoopEvent]) -> Vec<CloseReason> {
        events
            .iter()
            .filter_map(|e| match e {
                LoopEvent::Closed { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn server(config: LoopConfig) -> (EventLoop, SocketAddr, Arc<RecordingObserver>) {
        let recorder = Arc::new(RecordingObserver::new());
        let mut event_loop = EventLoop::new(config, TestResponder, recorder.clone()).unwrap();
        let (_, addr) = event_loop.listen(loopback()).unwrap();
        (event_loop, addr, recorder)
    }

    fn client(addr: SocketAddr) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream
    }

    fn read_n(stream: &mut std::net::TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn accepted_ids(events: &[LoopEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                LoopEvent::Accepted { conn_id, .. } => Some(*conn_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_each_accept_registers_distinct_reader() {
        let (mut event_loop, addr, recorder) = server(LoopConfig::default());
        let _clients: Vec<_> = (0..3).map(|_| client(addr)).collect();

        let deadline = Instant::now() + WAIT;
        while accepted_ids(&recorder.events()).len() < 3 && Instant::now() < deadline {
            event_loop.turn(Some(Duration::from_millis(50))).unwrap();
        }

        let ids = accepted_ids(&recorder.events());
        assert_eq!(ids.len(), 3);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 3);
        for id in &ids {
            assert_eq!(
                event_loop.selector.interest(Token(*id)),
                Some(Interest::Read)
            );
        }
        // Listener plus three connections, each registered once.
        assert_eq!(event_loop.selector.len(), 4);
        assert_eq!(event_loop.channel_count(), 4);
    }

    #[test]
    fn test_round_trip_and_alternation() {
        let (event_loop, addr, recorder) = server(LoopConfig::default());
        let handle = event_loop.start().unwrap();

        let mut stream = client(addr);
        for _ in 0..3 {
            stream.write_all(b"PING\r\n").unwrap();
            assert_eq!(read_n(&mut stream, 6), b"PONG\r\n");
        }
        handle.stop().unwrap();

        let steps: Vec<&str> = recorder
            .events()
            .iter()
            .filter_map(|e| match e {
                LoopEvent::Received { .. } => Some("recv"),
                LoopEvent::Sent { .. } => Some("sent"),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec!["recv", "sent", "recv", "sent", "recv", "sent"]);
        assert_eq!(recorder.events().last(), Some(&LoopEvent::Stopped));
    }

    #[test]
    fn test_failure_is_isolated_to_one_channel() {
        let (event_loop, addr, recorder) = server(LoopConfig::default());
        let handle = event_loop.start().unwrap();

        let mut healthy = client(addr);
        let mut faulty = client(addr);

        healthy.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_n(&mut healthy, 6), b"PONG\r\n");

        faulty.write_all(b"BOOM\r\n").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(faulty.read(&mut buf).unwrap(), 0);

        for _ in 0..2 {
            healthy.write_all(b"PING\r\n").unwrap();
            assert_eq!(read_n(&mut healthy, 6), b"PONG\r\n");
        }

        let closed_with_error = recorder.events().iter().any(|e| {
            matches!(
                e,
                LoopEvent::Closed {
                    reason: CloseReason::Error { kind: io::ErrorKind::Other, .. },
                    ..
                }
            )
        });
        assert!(closed_with_error);
        handle.stop().unwrap();
    }

    #[test]
    fn test_coalesced_frames_each_answered() {
        let (event_loop, addr, _recorder) = server(LoopConfig::default());
        let handle = event_loop.start().unwrap();

        let mut stream = client(addr);
        stream.write_all(b"PING\r\nPING\r\nPING\r\n").unwrap();
        assert_eq!(read_n(&mut stream, 18), b"PONG\r\nPONG\r\nPONG\r\n");
        handle.stop().unwrap();
    }

    #[test]
    fn test_partial_frame_waits_for_rest() {
        let (event_loop, addr, _recorder) = server(LoopConfig::default());
        let handle = event_loop.start().unwrap();

        let mut stream = client(addr);
        stream.write_all(b"PI").unwrap();
        thread::sleep(Duration::from_millis(50));
        stream.write_all(b"NG\r\n").unwrap();
        assert_eq!(read_n(&mut stream, 6), b"PONG\r\n");
        handle.stop().unwrap();
    }

    #[test]
    fn test_oversized_frame_closes_channel() {
        let config = LoopConfig {
            buffer_size: 8,
            ..LoopConfig::default()
        };
        let (event_loop, addr, recorder) = server(config);
        let handle = event_loop.start().unwrap();

        let mut stream = client(addr);
        stream.write_all(&[b'x'; 32]).unwrap();
        let mut buf = [0u8; 8];
        // Closed by the server, either cleanly or with a reset.
        assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));

        assert!(recorder.wait_until(WAIT, |events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    LoopEvent::Closed {
                        reason: CloseReason::Error { kind: io::ErrorKind::InvalidData, .. },
                        ..
                    }
                )
            })
        }));
        handle.stop().unwrap();
    }

    #[test]
    fn test_delayed_reply_does_not_block_others() {
        let (event_loop, addr, _recorder) = server(LoopConfig::default());
        let handle = event_loop.start().unwrap();

        let mut slow = client(addr);
        let mut fast = client(addr);

        let start = Instant::now();
        slow.write_all(b"SLOW\r\n").unwrap();
        fast.write_all(b"PING\r\n").unwrap();

        assert_eq!(read_n(&mut fast, 6), b"PONG\r\n");
        let fast_elapsed = start.elapsed();

        assert_eq!(read_n(&mut slow, 6), b"LATE\r\n");
        let slow_elapsed = start.elapsed();

        assert!(fast_elapsed < Duration::from_millis(300));
        assert!(slow_elapsed >= Duration::from_millis(300));
        handle.stop().unwrap();
    }

    #[test]
    fn test_send_then_close() {
        let (event_loop, addr, recorder) = server(LoopConfig::default());
        let handle = event_loop.start().unwrap();

        let mut stream = client(addr);
        stream.write_all(b"QUIT\r\n").unwrap();
        assert_eq!(read_n(&mut stream, 4), b"OK\r\n");
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);

        assert!(recorder.wait_until(WAIT, |events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    LoopEvent::Closed {
                        reason: CloseReason::Handler,
                        ..
                    }
                )
            })
        }));
        handle.stop().unwrap();
    }

    #[test]
    fn test_connect_signals_and_sends_opening_frame() {
        let listener = std::net::TcpListener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();

        let recorder = Arc::new(RecordingObserver::new());
        let mut event_loop =
            EventLoop::new(LoopConfig::default(), TestResponder, recorder.clone()).unwrap();
        let (_, connected) = event_loop.connect(addr).unwrap();
        let handle = event_loop.start().unwrap();

        assert_eq!(connected.recv_timeout(WAIT).unwrap().unwrap(), addr);

        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(WAIT)).unwrap();
        assert_eq!(read_n(&mut peer, 6), b"PING\r\n");

        // The responder answers every frame, so the next frame is PONG.
        peer.write_all(b"PONG\r\n").unwrap();
        assert_eq!(read_n(&mut peer, 6), b"PONG\r\n");
        handle.stop().unwrap();
    }

    #[test]
    fn test_stop_interrupts_idle_wait() {
        let recorder = Arc::new(RecordingObserver::new());
        let mut event_loop =
            EventLoop::new(LoopConfig::default(), TestResponder, recorder.clone()).unwrap();
        event_loop.listen(loopback()).unwrap();
        let handle = event_loop.start().unwrap();
        assert_eq!(handle.name(), "event-loop");

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        handle.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));

        let events = recorder.events();
        assert!(events.iter().any(|e| matches!(
            e,
            LoopEvent::Closed {
                reason: CloseReason::Shutdown,
                ..
            }
        )));
        assert_eq!(events.last(), Some(&LoopEvent::Stopped));
    }

    #[test]
    fn test_wait_bound_prefers_earliest_deadline() {
        let recorder = Arc::new(RecordingObserver::new());
        let mut event_loop =
            EventLoop::new(LoopConfig::default(), TestResponder, recorder).unwrap();
        let now = Instant::now();

        assert_eq!(event_loop.wait_bound(None, now), None);
        event_loop
            .deferred
            .push((now + Duration::from_millis(40), Token(0)));
        assert_eq!(
            event_loop.wait_bound(None, now),
            Some(Duration::from_millis(40))
        );
        assert_eq!(
            event_loop.wait_bound(Some(Duration::from_millis(10)), now),
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_handler_close_on_message() {
        let recorder = Arc::new(RecordingObserver::new());
        let mut event_loop =
            EventLoop::new(LoopConfig::default(), Closer, recorder.clone()).unwrap();
        let (_, addr) = event_loop.listen(loopback()).unwrap();
        let handle = event_loop.start().unwrap();

        let mut stream = client(addr);
        stream.write_all(b"PING\r\n").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);

        assert!(recorder.wait_until(WAIT, |events| {
            close_reasons(events).contains(&CloseReason::Handler)
        }));
        handle.stop().unwrap();

        // The listener goes on shutdown; nothing is reported as a failure.
        assert_eq!(
            close_reasons(&recorder.events()),
            vec![CloseReason::Handler, CloseReason::Shutdown]
        );
    }

    #[test]
    fn test_handler_close_on_connect() {
        let listener = std::net::TcpListener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();

        let recorder = Arc::new(RecordingObserver::new());
        let mut event_loop =
            EventLoop::new(LoopConfig::default(), Closer, recorder.clone()).unwrap();
        let (_, connected) = event_loop.connect(addr).unwrap();
        let handle = event_loop.start().unwrap();

        assert_eq!(connected.recv_timeout(WAIT).unwrap().unwrap(), addr);

        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(WAIT)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);

        assert!(recorder.wait_until(WAIT, |events| {
            close_reasons(events).contains(&CloseReason::Handler)
        }));
        handle.stop().unwrap();
        assert_eq!(close_reasons(&recorder.events()), vec![CloseReason::Handler]);
    }

    #[test]
    fn test_parked_listener_holds_pending_connections() {
        let recorder = Arc::new(RecordingObserver::new());
        let mut event_loop =
            EventLoop::new(LoopConfig::default(), TestResponder, recorder.clone()).unwrap();
        let (listener, addr) = event_loop.listen(loopback()).unwrap();
        let _stream = client(addr);

        // Take the accept event without accepting, as a failed accept does.
        let ready = event_loop.selector.wait(Some(WAIT)).unwrap();
        assert!(ready.iter().any(|e| e.token == listener));
        let parked_at = Instant::now();
        event_loop.apply(listener, Ok(Next::Park(parked_at + ACCEPT_BACKOFF)));

        assert_eq!(event_loop.turn(Some(Duration::from_millis(20))).unwrap(), 0);
        assert_eq!(event_loop.channel_count(), 1);

        let deadline = Instant::now() + WAIT;
        while event_loop.channel_count() < 2 && Instant::now() < deadline {
            event_loop.turn(Some(Duration::from_millis(50))).unwrap();
        }
        assert_eq!(event_loop.channel_count(), 2);
        assert!(parked_at.elapsed() >= ACCEPT_BACKOFF);
        assert_eq!(accepted_ids(&recorder.events()).len(), 1);
    }
}
