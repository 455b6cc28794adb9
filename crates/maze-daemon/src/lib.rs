//! Single-threaded, event-driven TCP server for the followermaze protocol.
//!
//! One thread runs a readiness-based reactor ([`reactor::Reactor`]) over
//! three listening sockets: an admin port (shutdown commands), an
//! event-source port (the strictly-ordered event stream), and a user-client
//! port (fan-out subscribers). Per-connection [`handlers`] translate socket
//! readiness into engine calls; the engine's notifications flow back into
//! per-client outbound buffers and are flushed when the reactor reports the
//! socket writable.
//!
//! Everything is cooperative and synchronous: a callback runs to completion
//! before the next readiness wait, so no state in the process needs a lock.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod reactor;
pub mod server;
