//! Server assembly: binds the three listening sockets and runs the reactor.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use maze_core::FollowEngine;
use mio::net::TcpListener;
use mio::Interest;
use thiserror::Error;
use tracing::info;

use crate::config::ServerConfig;
use crate::handlers::{Acceptor, Role, SharedEngine};
use crate::reactor::{Control, Reactor, ReactorError};

#[derive(Debug, Error)]
pub enum ServerError {
    /// A listening socket could not be bound.
    #[error("failed to bind port {port}")]
    Bind {
        /// The port that failed to bind.
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The reactor failed to start or dispatch.
    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

/// The assembled followermaze server.
///
/// Holds the reactor with its three acceptors registered; [`Server::serve`]
/// blocks until an admin connection requests a stop or dispatch fails. The
/// server is single-threaded and not `Send`; bind it on the thread that will
/// serve.
pub struct Server {
    reactor: Reactor,
    admin_addr: SocketAddr,
    event_addr: SocketAddr,
    user_addr: SocketAddr,
}

impl Server {
    /// Binds the admin, event-source, and user-client listeners and registers
    /// their acceptors with a fresh reactor.
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let mut reactor = Reactor::new()?;
        let engine: SharedEngine = Rc::new(RefCell::new(FollowEngine::new()));
        let wake = reactor.write_scheduler();

        let admin = bind_listener(config.admin_port)?;
        let event = bind_listener(config.event_port)?;
        let user = bind_listener(config.user_port)?;

        let admin_addr = admin.local_addr().map_err(ReactorError::Io)?;
        let event_addr = event.local_addr().map_err(ReactorError::Io)?;
        let user_addr = user.local_addr().map_err(ReactorError::Io)?;

        reactor.register(
            Box::new(Acceptor::new(admin, Role::Admin, engine.clone(), wake.clone())),
            Interest::READABLE,
        )?;
        reactor.register(
            Box::new(Acceptor::new(
                event,
                Role::EventSource,
                engine.clone(),
                wake.clone(),
            )),
            Interest::READABLE,
        )?;
        reactor.register(
            Box::new(Acceptor::new(user, Role::UserClient, engine, wake)),
            Interest::READABLE,
        )?;

        info!(port = admin_addr.port(), "listening for admin connections");
        info!(port = event_addr.port(), "listening for event sources");
        info!(port = user_addr.port(), "listening for user clients");

        Ok(Self {
            reactor,
            admin_addr,
            event_addr,
            user_addr,
        })
    }

    /// Runs the serve loop until a stop is requested.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        loop {
            match self.reactor.run_once()? {
                Control::Continue => {}
                Control::Stop => {
                    info!("server stopping");
                    return Ok(());
                }
            }
        }
    }

    #[must_use]
    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    #[must_use]
    pub fn event_addr(&self) -> SocketAddr {
        self.event_addr
    }

    #[must_use]
    pub fn user_addr(&self) -> SocketAddr {
        self.user_addr
    }
}

fn bind_listener(port: u16) -> Result<TcpListener, ServerError> {
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).map_err(|source| ServerError::Bind { port, source })
}
