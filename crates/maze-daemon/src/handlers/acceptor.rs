//! Listening-socket handler: accepts connections and spawns role handlers.

use std::io;

use mio::event::Source;
use mio::net::TcpListener;
use mio::{Interest, Token};
use tracing::{info, warn};

use crate::connection::Connection;
use crate::reactor::{Action, Handler, WriteScheduler};

use super::{AdminHandler, EventSourceHandler, SharedEngine, UserClientHandler};

/// Which protocol role a listening port serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    EventSource,
    UserClient,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::EventSource => "event source",
            Self::UserClient => "user client",
        }
    }
}

/// Accepts connections on one listening socket and hands each one a handler
/// matching the socket's role.
pub struct Acceptor {
    listener: TcpListener,
    role: Role,
    engine: SharedEngine,
    wake: WriteScheduler,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        role: Role,
        engine: SharedEngine,
        wake: WriteScheduler,
    ) -> Self {
        Self {
            listener,
            role,
            engine,
            wake,
        }
    }

    fn handler_for(&self, conn: Connection) -> Box<dyn Handler> {
        match self.role {
            Role::Admin => Box::new(AdminHandler::new(conn)),
            Role::EventSource => Box::new(EventSourceHandler::new(conn, self.engine.clone())),
            Role::UserClient => Box::new(UserClientHandler::new(
                conn,
                self.engine.clone(),
                self.wake.clone(),
            )),
        }
    }
}

impl Handler for Acceptor {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    /// Drains the accept queue. A failed accept is logged and the listener
    /// keeps serving; only the kernel telling us to wait ends the pass.
    fn on_readable(&mut self, _token: Token) -> Action {
        let mut spawned: Vec<(Box<dyn Handler>, Interest)> = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, role = self.role.name(), "connection accepted");
                    let handler = self.handler_for(Connection::new(stream, peer));
                    spawned.push((handler, Interest::READABLE));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(role = self.role.name(), error = %e, "accept failed");
                    break;
                }
            }
        }

        if spawned.is_empty() {
            Action::Continue
        } else {
            Action::Spawn(spawned)
        }
    }
}
