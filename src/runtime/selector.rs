//! Readiness multiplexer over `mio::Poll`.
//!
//! mio reports readiness edges (epoll with `EPOLLET`, kqueue with
//! `EV_CLEAR`). The selector layers one-shot delivery on top: once a
//! channel's event is returned from [`Selector::wait`] the registration is
//! disarmed, and nothing more is reported for it until the next
//! [`Selector::register`]. Re-registering asks the OS to re-evaluate the
//! socket, so readiness that is still pending is reported again, which
//! gives the caller level-triggered behaviour.

use crate::runtime::connection::{Channel, ConnState};
use mio::{Events, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Reserved for the selector's waker.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// The single operation a channel is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Accept,
    Connect,
    Read,
    Write,
}

impl Interest {
    fn to_mio(self) -> mio::Interest {
        match self {
            Interest::Accept | Interest::Read => mio::Interest::READABLE,
            Interest::Connect | Interest::Write => mio::Interest::WRITABLE,
        }
    }

    fn satisfied_by(self, event: &mio::event::Event) -> bool {
        let ready = match self {
            Interest::Accept | Interest::Read => event.is_readable(),
            Interest::Connect | Interest::Write => event.is_writable(),
        };
        ready || event.is_error() || event.is_read_closed() || event.is_write_closed()
    }
}

/// A registered channel whose interest is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub interest: Interest,
    /// The OS flagged an error condition on the socket.
    pub error: bool,
    /// The peer closed one or both directions.
    pub hangup: bool,
}

/// Registration failures. None of these are fatal to the loop.
#[derive(Debug)]
pub enum RegistrationError {
    /// The channel was already closed.
    Closed(Token),
    /// The token collides with the selector's waker.
    ReservedToken,
    /// The OS refused the registration.
    Io(io::Error),
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationError::Closed(token) => {
                write!(f, "cannot register closed channel {}", token.0)
            }
            RegistrationError::ReservedToken => write!(f, "token is reserved for the waker"),
            RegistrationError::Io(e) => write!(f, "registration failed: {e}"),
        }
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistrationError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RegistrationError {
    fn from(e: io::Error) -> Self {
        RegistrationError::Io(e)
    }
}

impl From<RegistrationError> for io::Error {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidInput, other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    interest: Interest,
    armed: bool,
}

/// One selector per event loop thread.
pub struct Selector {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    registrations: HashMap<Token, Registration>,
    /// Channels that are ready without a new OS event (data already buffered).
    pending: Vec<Token>,
}

impl Selector {
    /// Open the OS poller. `capacity` bounds the events taken per `wait`.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity.max(1)),
            waker,
            registrations: HashMap::new(),
            pending: Vec::new(),
        })
    }

    /// Handle used by other threads to interrupt a blocked `wait`.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Register `channel` for exactly `interest`, replacing any previous
    /// interest, and arm it for one delivery.
    pub fn register(
        &mut self,
        token: Token,
        channel: &mut Channel,
        interest: Interest,
    ) -> Result<(), RegistrationError> {
        if token == WAKER_TOKEN {
            return Err(RegistrationError::ReservedToken);
        }
        if channel.state() == ConnState::Closed {
            return Err(RegistrationError::Closed(token));
        }

        let registry = self.poll.registry();
        match self.registrations.get_mut(&token) {
            Some(reg) => {
                registry.reregister(channel.socket_mut(), token, interest.to_mio())?;
                reg.interest = interest;
                reg.armed = true;
            }
            None => {
                registry.register(channel.socket_mut(), token, interest.to_mio())?;
                self.registrations.insert(
                    token,
                    Registration {
                        interest,
                        armed: true,
                    },
                );
            }
        }
        Ok(())
    }

    /// Remove `channel` from the poller. Unknown tokens are ignored.
    pub fn deregister(&mut self, token: Token, channel: &mut Channel) -> io::Result<()> {
        self.pending.retain(|t| *t != token);
        if self.registrations.remove(&token).is_some() {
            self.poll.registry().deregister(channel.socket_mut())?;
        }
        Ok(())
    }

    /// Report `token` as ready on the next `wait` without an OS event.
    ///
    /// Used when a complete frame is already buffered. Has no effect unless
    /// the channel is armed.
    pub fn mark_ready(&mut self, token: Token) {
        let armed = self.registrations.get(&token).is_some_and(|r| r.armed);
        if armed && !self.pending.contains(&token) {
            self.pending.push(token);
        }
    }

    /// Current interest of `token`, if registered.
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.registrations.get(&token).map(|r| r.interest)
    }

    /// Whether `token` will be reported on its next readiness.
    pub fn is_armed(&self, token: Token) -> bool {
        self.registrations.get(&token).is_some_and(|r| r.armed)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Block until an armed channel is ready, `timeout` elapses, or the
    /// waker fires. Timeouts and wake-ups return an empty set.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let timeout = if self.pending.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.events.clear(),
            Err(e) => return Err(e),
        }

        let mut ready = Vec::with_capacity(self.pending.len());

        for token in std::mem::take(&mut self.pending) {
            if let Some(reg) = self.registrations.get_mut(&token) {
                if reg.armed {
                    reg.armed = false;
                    ready.push(ReadyEvent {
                        token,
                        interest: reg.interest,
                        error: false,
                        hangup: false,
                    });
                }
            }
        }

        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let Some(reg) = self.registrations.get_mut(&token) else {
                continue;
            };
            if !reg.armed || !reg.interest.satisfied_by(event) {
                continue;
            }
            reg.armed = false;
            ready.push(ReadyEvent {
                token,
                interest: reg.interest,
                error: event.is_error(),
                hangup: event.is_read_closed() || event.is_write_closed(),
            });
        }

        Ok(ready)
    }
}
