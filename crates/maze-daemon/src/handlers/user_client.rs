//! User-client connection handler.
//!
//! The first complete line names the user the connection represents; from
//! then on the handler only flushes engine notifications out of its outbound
//! buffer. Clients never send anything after the identity line, but extra
//! input is tolerated and discarded.

use std::cell::RefCell;
use std::rc::Rc;

use maze_core::{protocol, UserId};
use mio::event::Source;
use mio::{Interest, Token};
use tracing::{info, warn};

use crate::connection::{Connection, ReadState, WriteState};
use crate::reactor::{Action, Handler, WriteScheduler};

use super::{ClientHandle, SharedEngine};

pub struct UserClientHandler {
    conn: Connection,
    engine: SharedEngine,
    wake: WriteScheduler,
    inbox: String,
    outbox: Rc<RefCell<Vec<u8>>>,
    user_id: Option<UserId>,
    token: Option<Token>,
}

impl UserClientHandler {
    pub fn new(conn: Connection, engine: SharedEngine, wake: WriteScheduler) -> Self {
        Self {
            conn,
            engine,
            wake,
            inbox: String::new(),
            outbox: Rc::new(RefCell::new(Vec::new())),
            user_id: None,
            token: None,
        }
    }

    /// Attempts the one-time registration, consuming buffered lines until
    /// one parses as an identity or no complete line remains. Junk lines are
    /// spent individually; an unterminated remainder stays for the next read.
    fn try_register(&mut self, token: Token) {
        let mut start = 0;
        while self.user_id.is_none() {
            let mut next = start;
            if protocol::find_message(&self.inbox, &mut next).is_none() {
                break;
            }

            let handle = ClientHandle::new(token, self.outbox.clone(), self.wake.clone());
            if let Some(id) = self.engine.borrow_mut().register_user(handle, &self.inbox[start..])
            {
                info!(peer = %self.conn.peer(), user = id, "user client registered");
                self.user_id = Some(id);
                self.token = Some(token);
            }
            start = next;
        }
        self.inbox.drain(..start);
    }

    fn teardown(&mut self) -> Action {
        if let (Some(id), Some(token)) = (self.user_id.take(), self.token.take()) {
            info!(peer = %self.conn.peer(), user = id, "user client disconnected");
            let probe = ClientHandle::new(token, self.outbox.clone(), self.wake.clone());
            self.engine.borrow_mut().unregister_user(id, &probe);
        }
        self.inbox.clear();
        self.outbox.borrow_mut().clear();
        Action::Close
    }
}

impl Handler for UserClientHandler {
    fn source(&mut self) -> &mut dyn Source {
        self.conn.source()
    }

    fn on_readable(&mut self, token: Token) -> Action {
        let state = match self.conn.read_available(&mut self.inbox) {
            Ok(state) => state,
            Err(e) => {
                warn!(peer = %self.conn.peer(), error = %e, "user client read failed");
                return self.teardown();
            }
        };

        if self.user_id.is_none() {
            self.try_register(token);
        } else {
            // Registered clients have nothing left to say.
            self.inbox.clear();
        }

        match state {
            ReadState::Open => Action::Continue,
            ReadState::Closed => self.teardown(),
        }
    }

    fn on_writable(&mut self, _token: Token) -> Action {
        let mut outbox = self.outbox.borrow_mut();
        match self.conn.write_buffered(&mut outbox) {
            Ok(WriteState::Flushed) => Action::Rearm(Interest::READABLE),
            Ok(WriteState::Pending) => Action::Continue,
            Ok(WriteState::Closed) => {
                drop(outbox);
                self.teardown()
            }
            Err(e) => {
                warn!(peer = %self.conn.peer(), error = %e, "user client write failed");
                drop(outbox);
                self.teardown()
            }
        }
    }

    fn on_close(&mut self, _token: Token) -> Action {
        self.teardown()
    }

    fn on_error(&mut self, _token: Token) -> Action {
        self.teardown()
    }
}
