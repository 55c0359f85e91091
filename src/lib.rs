//! fabric-rpc - a remote procedure call runtime for high-performance
//! interconnects.
//!
//! This library issues typed request/response exchanges between processes
//! over a pluggable network abstraction that supports both two-sided tagged
//! messaging (send/recv) and one-sided remote memory access (put/get).
//!
//! ## Main Components
//!
//! - `net`: the network abstraction layer. An endpoint multiplexes
//!   unexpected sends, expected (tag-matched) receives, and RMA onto one
//!   event queue, with per-peer matching, early-arrival caching, and a
//!   cooperative progress engine. Transports plug in beneath it through the
//!   `net::Transport` trait; `net::loopback` is the in-process reference
//!   transport.
//!
//! - `rpc`: the forwarding engine. A `rpc::Runtime` registers procedures by
//!   name, encodes inputs behind a fixed request header (spilling oversize
//!   inputs into an RMA-readable extra buffer), pre-posts the response
//!   receive, and decodes verified responses back into caller-owned
//!   outputs.
//!
//! - `error`: the stable status code enumeration shared by the API and the
//!   wire protocol.
//!
//! ## Usage
//!
//! Open a transport endpoint, bring up a `rpc::Runtime` over it, register
//! procedures, then `forward` calls and `wait` on the returned requests.
//! The runtime spawns no threads of its own: callers drive it through
//! `progress` and `wait`.

pub mod error;
pub mod net;
pub mod rpc;

pub use error::{error_string, Error};
