//! readiness-loop: a readiness-driven TCP event loop.
//!
//! One `EventLoop` per thread multiplexes non-blocking sockets through a
//! `Selector` (mio: epoll on Linux, kqueue on macOS). Each channel is a
//! small state machine alternating between reading a frame and writing the
//! reply; what the reply is comes from a pluggable `Handler`.
//!
//! The `server` and `client` modules wire this into a ping/pong pair:
//! the server answers every request with a fixed reply, the client sends a
//! request after every reply, waiting a fixed delay in between.

pub mod client;
pub mod config;
pub mod protocols;
pub mod runtime;
pub mod server;
