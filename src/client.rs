//! Ping client.
//!
//! Starts a connect on a fresh event loop, runs the loop on its own thread
//! and waits, with a bound, for the connect to complete. If the bound is
//! exceeded the loop is stopped and the socket released.

use crate::config::Config;
use crate::protocols::ping::Pinger;
use crate::runtime::{EventLoop, Handler, LoopConfig, LoopHandle, Observer, TracingObserver};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Client startup failures.
#[derive(Debug)]
pub enum ClientError {
    /// The loop or socket could not be created.
    Io(io::Error),
    /// The connect failed before the bound (e.g. refused).
    Connect(io::Error),
    /// The connect did not complete within the bound.
    ConnectTimeout { addr: SocketAddr, after: Duration },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "client I/O error: {e}"),
            ClientError::Connect(e) => write!(f, "connect failed: {e}"),
            ClientError::ConnectTimeout { addr, after } => {
                write!(f, "connect to {addr} did not complete within {after:?}")
            }
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Io(e) | ClientError::Connect(e) => Some(e),
            ClientError::ConnectTimeout { .. } => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// A connected client loop.
pub struct Client {
    handle: LoopHandle,
    peer: SocketAddr,
}

impl Client {
    /// Start the ping client described by `config` against `addr`.
    ///
    /// Every reply is also delivered on the returned receiver, which ends
    /// when the connection closes.
    pub fn start(config: &Config, addr: SocketAddr) -> Result<(Self, Receiver<Bytes>), ClientError> {
        let (tx, rx) = mpsc::channel();
        let pinger = Pinger::new(config.request.clone(), config.delay)
            .with_rounds(config.rounds)
            .with_replies(tx);

        let client = Self::start_with(
            LoopConfig::from_config(config, "client"),
            addr,
            config.connect_timeout,
            pinger,
            Arc::new(TracingObserver::new("client")),
        )?;
        Ok((client, rx))
    }

    /// Start a client loop with any handler and observer.
    pub fn start_with<H>(
        loop_config: LoopConfig,
        addr: SocketAddr,
        connect_timeout: Duration,
        handler: H,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, ClientError>
    where
        H: Handler + 'static,
    {
        let mut event_loop = EventLoop::new(loop_config, handler, observer)?;
        let (_, connected) = event_loop.connect(addr).map_err(ClientError::Connect)?;

        let started = Instant::now();
        let handle = event_loop.start()?;

        match connected.recv_timeout(connect_timeout) {
            Ok(Ok(peer)) => {
                info!(peer = %peer, elapsed = ?started.elapsed(), "Client connected");
                Ok(Self { handle, peer })
            }
            Ok(Err(e)) => {
                abort(handle);
                Err(ClientError::Connect(e))
            }
            Err(RecvTimeoutError::Timeout) => {
                abort(handle);
                Err(ClientError::ConnectTimeout {
                    addr,
                    after: connect_timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                abort(handle);
                Err(ClientError::Connect(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "event loop exited before connecting",
                )))
            }
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Close the connection and join the loop thread.
    pub fn stop(self) -> io::Result<()> {
        self.handle.stop()
    }
}

/// Stop a client loop that failed to start; its channels are closed on exit.
fn abort(handle: LoopHandle) {
    if let Err(e) = handle.stop() {
        warn!(error = %e, "Client loop failed during abort");
    }
}
