//! Payload policies layered on the event loop through `Handler`.
//!
//! - `ping`: fixed request/reply exchange with a delay between rounds

pub mod ping;
