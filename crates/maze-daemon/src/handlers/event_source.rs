//! Event-source connection handler.
//!
//! Feeds raw stream text into the engine and, when the source goes away,
//! resets the engine so a reconnecting source can restart its sequence
//! numbers from the beginning.

use mio::event::Source;
use mio::Token;
use tracing::{info, warn};

use crate::connection::{Connection, ReadState};
use crate::reactor::{Action, Handler};

use super::SharedEngine;

pub struct EventSourceHandler {
    conn: Connection,
    engine: SharedEngine,
    buffer: String,
}

impl EventSourceHandler {
    pub fn new(conn: Connection, engine: SharedEngine) -> Self {
        Self {
            conn,
            engine,
            buffer: String::new(),
        }
    }

    fn reset_and_close(&mut self) -> Action {
        info!(peer = %self.conn.peer(), "event source disconnected");
        self.engine.borrow_mut().reset();
        self.buffer.clear();
        Action::Close
    }
}

impl Handler for EventSourceHandler {
    fn source(&mut self) -> &mut dyn Source {
        self.conn.source()
    }

    fn on_readable(&mut self, _token: Token) -> Action {
        let state = match self.conn.read_available(&mut self.buffer) {
            Ok(state) => state,
            Err(e) => {
                warn!(peer = %self.conn.peer(), error = %e, "event source read failed");
                return self.reset_and_close();
            }
        };

        // Complete lines are consumed; the unterminated remainder stays in
        // the buffer for the next read.
        self.engine.borrow_mut().ingest(&mut self.buffer);

        match state {
            ReadState::Open => Action::Continue,
            ReadState::Closed => self.reset_and_close(),
        }
    }

    fn on_close(&mut self, _token: Token) -> Action {
        self.reset_and_close()
    }

    fn on_error(&mut self, _token: Token) -> Action {
        self.reset_and_close()
    }
}
