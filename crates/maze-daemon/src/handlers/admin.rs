//! Admin connection handler: the out-of-band shutdown channel.

use maze_core::protocol;
use mio::event::Source;
use mio::Token;
use tracing::{info, warn};

use crate::connection::{Connection, ReadState};
use crate::reactor::{Action, Handler};

/// Command prefix that shuts the server down.
pub const STOP_COMMAND: &str = "stop";

/// Reads commands from an admin connection, one line at a time. A line
/// beginning with [`STOP_COMMAND`] stops the server; any other line gets no
/// response and no disconnect.
pub struct AdminHandler {
    conn: Connection,
    buffer: String,
}

impl AdminHandler {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            buffer: String::new(),
        }
    }
}

impl Handler for AdminHandler {
    fn source(&mut self) -> &mut dyn Source {
        self.conn.source()
    }

    fn on_readable(&mut self, _token: Token) -> Action {
        let state = match self.conn.read_available(&mut self.buffer) {
            Ok(state) => state,
            Err(e) => {
                warn!(peer = %self.conn.peer(), error = %e, "admin read failed");
                return Action::Close;
            }
        };

        // Each complete line is matched on its leading bytes and consumed,
        // so junk never shadows a later stop command.
        let mut start = 0;
        let mut stop = false;
        while let Some(line) = protocol::find_message(&self.buffer, &mut start) {
            if line.starts_with(STOP_COMMAND) {
                stop = true;
            }
        }
        self.buffer.drain(..start);

        if stop {
            info!(peer = %self.conn.peer(), "stop requested");
            return Action::Stop;
        }

        match state {
            ReadState::Open => Action::Continue,
            ReadState::Closed => Action::Close,
        }
    }
}
