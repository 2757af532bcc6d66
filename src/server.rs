//! Ping server.
//!
//! Binds the listener, then runs the accept/read/write loop on a dedicated
//! thread. The listener is bound before `start` returns, so clients can
//! connect as soon as they have the address.

use crate::config::Config;
use crate::protocols::ping::PongResponder;
use crate::runtime::{EventLoop, Handler, LoopConfig, LoopHandle, Observer, TracingObserver};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// A running server loop.
pub struct Server {
    handle: LoopHandle,
    local_addr: SocketAddr,
}

impl Server {
    /// Start the ping server described by `config`.
    pub fn start(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let addr = config.addr()?;
        let server = Self::start_with(
            LoopConfig::from_config(config, "server"),
            addr,
            PongResponder::new(config.reply.clone()),
            Arc::new(TracingObserver::new("server")),
        )?;
        Ok(server)
    }

    /// Start a server loop with any handler and observer.
    pub fn start_with<H>(
        loop_config: LoopConfig,
        addr: SocketAddr,
        handler: H,
        observer: Arc<dyn Observer>,
    ) -> io::Result<Self>
    where
        H: Handler + 'static,
    {
        let mut event_loop = EventLoop::new(loop_config, handler, observer)?;
        let (_, local_addr) = event_loop.listen(addr)?;
        let handle = event_loop.start()?;

        info!(addr = %local_addr, "Server started");
        Ok(Self { handle, local_addr })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every connection and join the loop thread.
    pub fn stop(self) -> io::Result<()> {
        self.handle.stop()
    }
}
