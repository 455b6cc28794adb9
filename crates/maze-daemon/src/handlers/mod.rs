//! Per-role connection handlers.
//!
//! Each accepted connection gets a handler matching the port it arrived on:
//! [`AdminHandler`] (shutdown commands), [`EventSourceHandler`] (the ordered
//! event stream), or [`UserClientHandler`] (subscribers). The acceptor for
//! each listening socket decides the role.
//!
//! Handlers share the engine through `Rc<RefCell<..>>`; the reactor is
//! single-threaded and each borrow is confined to one callback, so the
//! borrows never overlap.

use std::cell::RefCell;
use std::rc::Rc;

use maze_core::{ClientSink, FollowEngine};
use mio::Token;

use crate::reactor::WriteScheduler;

mod acceptor;
mod admin;
mod event_source;
mod user_client;

pub use acceptor::{Acceptor, Role};
pub use admin::{AdminHandler, STOP_COMMAND};
pub use event_source::EventSourceHandler;
pub use user_client::UserClientHandler;

/// The engine as shared by every handler on the reactor thread.
pub type SharedEngine = Rc<RefCell<FollowEngine<ClientHandle>>>;

/// The engine-facing side of a user-client connection.
///
/// `send` appends to the connection's outbound buffer and schedules the slot
/// for write rearming; the actual socket write happens later, in the
/// handler's writable callback. Cloneable so the engine can hold one copy per
/// registration while the handler keeps the original.
#[derive(Clone)]
pub struct ClientHandle {
    token: Token,
    outbox: Rc<RefCell<Vec<u8>>>,
    wake: WriteScheduler,
}

impl ClientHandle {
    pub fn new(token: Token, outbox: Rc<RefCell<Vec<u8>>>, wake: WriteScheduler) -> Self {
        Self { token, outbox, wake }
    }
}

impl ClientSink for ClientHandle {
    fn send(&self, message: &str) {
        self.outbox.borrow_mut().extend_from_slice(message.as_bytes());
        self.wake.schedule(self.token);
    }
}

impl PartialEq for ClientHandle {
    /// One handle per connection slot, so the token is the identity.
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}
