//! Core library for the followermaze server.
//!
//! Two pieces live here, deliberately free of any socket I/O:
//!
//! - [`protocol`]: the stateless line-oriented wire codec (`seqnum|kind[|from
//!   [|to]]` events, numeric identity lines, `\n`-terminated notifications).
//! - [`engine`]: the ordering and business engine. It buffers out-of-order
//!   events, releases them in strict sequence-number order, applies
//!   follow/unfollow/broadcast/private/status-update semantics to an
//!   in-memory user registry, and fans notifications out through the
//!   [`engine::ClientSink`] trait.
//!
//! The daemon crate drives the engine from its reactor callbacks; tests drive
//! it with in-memory sinks. Both see identical behavior because the engine is
//! strictly synchronous: every mutation completes within the call that
//! triggered it.

pub mod engine;
pub mod protocol;

pub use engine::{ClientSink, FollowEngine, User};
pub use protocol::{Event, EventKind, Seqnum, UserId, FIRST_SEQNUM};
