//! Ping protocol.
//!
//! The client opens with a request and the server answers every request
//! with a fixed reply:
//!
//! ```text
//! Request:  PING
//! Response: PONG
//!
//! Request:  QUIT
//! Response: OK      (then the server closes)
//! ```
//!
//! Each message is framed by the loop's `Framing`; with the default line
//! framing this is `PING\r\n` / `PONG\r\n`. After every reply the client
//! waits a fixed delay before asking again.

pub mod handler;

pub use handler::{Pinger, PongResponder};
