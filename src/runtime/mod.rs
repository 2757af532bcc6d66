//! Readiness-driven runtime.
//!
//! Built on mio (epoll on Linux, kqueue on macOS). The pieces:
//! - `Selector`: one-shot readiness multiplexer over `mio::Poll`
//! - `Channel` / `ConnState`: per-socket state machine and buffers
//! - `EventLoop`: single-threaded driver, one per thread
//! - `Handler`: payload policy plugged into the loop
//! - `Observer`: where loop activity is reported

mod buffer;
mod connection;
mod event_loop;
pub mod framing;
mod handler;
mod observer;
mod selector;

pub use buffer::{ReadBuffer, WriteBuffer};
pub use connection::{Channel, ChannelRegistry, CloseReason, ConnState, Socket, Step};
pub use event_loop::{EventLoop, LoopConfig, LoopHandle};
pub use framing::{Decoded, FrameError, Framing};
pub use handler::{Handler, Reply};
pub use observer::{LoopEvent, Observer, RecordingObserver, TracingObserver};
pub use selector::{Interest, ReadyEvent, RegistrationError, Selector, WAKER_TOKEN};
