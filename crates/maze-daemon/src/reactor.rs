//! Readiness demultiplexer over many sockets.
//!
//! The reactor owns a bounded slot arena of handlers, blocks on a single
//! `mio::Poll` wait, and dispatches each ready slot to exactly one handler
//! callback chosen by priority: error first, then hang-up, then readable,
//! then writable. Handlers never call back into the reactor; instead every
//! callback returns an [`Action`] describing what the reactor should do with
//! the slot, which keeps handler ownership in exactly one place. A handler
//! that asks to close is moved out of its slot and dropped after its own
//! cleanup has already run — there is no path on which a handler can be
//! destroyed twice or used after teardown.
//!
//! The admin handler's stop request surfaces as [`Control::Stop`] from
//! [`Reactor::run_once`]; it is a control-flow signal, not an error.
//!
//! mio is edge-triggered, so handlers are expected to drain reads, writes,
//! and accepts until `WouldBlock` within a single callback.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io;
use std::rc::Rc;

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use thiserror::Error;
use tracing::{trace, warn};

/// Default bound on concurrently registered handlers.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Errors from reactor registry and dispatch operations.
///
/// Capacity exhaustion and duplicate registration indicate a configuration
/// or logic defect and are fatal at startup; a failed readiness wait is
/// fatal to the run loop.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// No free slot remains in the handler registry.
    #[error("handler registry is full ({capacity} slots)")]
    Busy {
        /// Configured registry capacity.
        capacity: usize,
    },

    /// The handler's handle is already registered with the poller.
    #[error("handle is already registered")]
    DuplicateHandle,

    /// No handler occupies the given slot.
    #[error("no handler registered at slot {0:?}")]
    InvalidSlot(Token),

    /// The readiness wait or a registry operation failed at the OS level.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one pass through the serve loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Keep serving.
    Continue,
    /// A handler requested a clean shutdown.
    Stop,
}

/// What the reactor should do with a slot after its callback returned.
pub enum Action {
    /// Nothing; the slot keeps its current interest.
    Continue,
    /// Replace the slot's interest flags.
    Rearm(Interest),
    /// Register newly created handlers (from an acceptor). Deferred to the
    /// end of the dispatch pass so a slot freed earlier in the same pass is
    /// not reused while stale readiness events for it are still pending.
    Spawn(Vec<(Box<dyn Handler>, Interest)>),
    /// Deregister this slot and drop the handler. Role-specific cleanup must
    /// already have happened inside the callback.
    Close,
    /// Unwind the serve loop cleanly.
    Stop,
}

/// A registered connection handler.
///
/// One callback fires per ready slot per [`Reactor::run_once`] call. The
/// defaults tear the connection down; roles with cleanup obligations
/// (engine unregistration, engine reset) override `on_close`/`on_error`.
pub trait Handler {
    /// The I/O source to (de)register with the poller.
    fn source(&mut self) -> &mut dyn Source;

    fn on_readable(&mut self, token: Token) -> Action;

    fn on_writable(&mut self, _token: Token) -> Action {
        Action::Continue
    }

    fn on_close(&mut self, _token: Token) -> Action {
        Action::Close
    }

    fn on_error(&mut self, _token: Token) -> Action {
        Action::Close
    }
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Handler")
    }
}

/// Single-threaded queue of slots whose outbound buffer gained data during
/// the current callback.
///
/// The engine side appends to a client's outbox and schedules its token
/// here; after each dispatch the reactor drains the queue and rearms those
/// slots for read+write, so the next readiness wait delivers a writable
/// callback. This is how `send` arms write interest without handing
/// handlers a reference to the reactor.
#[derive(Clone, Default)]
pub struct WriteScheduler {
    pending: Rc<RefCell<BTreeSet<Token>>>,
}

impl WriteScheduler {
    pub fn schedule(&self, token: Token) {
        self.pending.borrow_mut().insert(token);
    }

    fn take(&self) -> BTreeSet<Token> {
        std::mem::take(&mut *self.pending.borrow_mut())
    }
}

/// Readiness bits captured from a poll event so dispatch can run without
/// borrowing the event list.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    error: bool,
    readable: bool,
    writable: bool,
    read_closed: bool,
    write_closed: bool,
}

impl Readiness {
    fn capture(event: &Event) -> Self {
        Self {
            error: event.is_error(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

/// The event demultiplexer: poller, handler arena, and write-rearm queue.
pub struct Reactor {
    poll: Poll,
    events: Events,
    slots: Slab<Box<dyn Handler>>,
    capacity: usize,
    wake: WriteScheduler,
}

impl Reactor {
    pub fn new() -> Result<Self, ReactorError> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, ReactorError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.min(1024)),
            slots: Slab::with_capacity(capacity.min(64)),
            capacity,
            wake: WriteScheduler::default(),
        })
    }

    /// Shared handle through which client sinks request write rearming.
    #[must_use]
    pub fn write_scheduler(&self) -> WriteScheduler {
        self.wake.clone()
    }

    /// Registers a handler with the given interest and transfers its
    /// ownership to the reactor.
    pub fn register(
        &mut self,
        mut handler: Box<dyn Handler>,
        interest: Interest,
    ) -> Result<Token, ReactorError> {
        if self.slots.len() >= self.capacity {
            return Err(ReactorError::Busy {
                capacity: self.capacity,
            });
        }

        let registry = self.poll.registry();
        let entry = self.slots.vacant_entry();
        let token = Token(entry.key());
        match handler.source().register(registry, token, interest) {
            Ok(()) => {
                trace!(slot = token.0, "handler registered");
                entry.insert(handler);
                Ok(token)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(ReactorError::DuplicateHandle)
            }
            Err(e) => Err(ReactorError::Io(e)),
        }
    }

    /// Replaces the interest flags of an already-registered slot.
    pub fn rearm(&mut self, token: Token, interest: Interest) -> Result<(), ReactorError> {
        let registry = self.poll.registry();
        let handler = self
            .slots
            .get_mut(token.0)
            .ok_or(ReactorError::InvalidSlot(token))?;
        handler.source().reregister(registry, token, interest)?;
        Ok(())
    }

    /// Removes the slot from the readiness set and returns ownership of the
    /// handler to the caller.
    pub fn deregister(&mut self, token: Token) -> Result<Box<dyn Handler>, ReactorError> {
        if !self.slots.contains(token.0) {
            return Err(ReactorError::InvalidSlot(token));
        }
        let mut handler = self.slots.remove(token.0);
        handler.source().deregister(self.poll.registry())?;
        trace!(slot = token.0, "handler deregistered");
        Ok(handler)
    }

    /// Blocks until at least one registered handle is ready, then dispatches
    /// every ready slot (in slot order) to exactly one callback.
    pub fn run_once(&mut self) -> Result<Control, ReactorError> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReactorError::Io(e)),
            }
        }

        let mut ready: Vec<(Token, Readiness)> = self
            .events
            .iter()
            .map(|event| (event.token(), Readiness::capture(event)))
            .collect();
        ready.sort_by_key(|(token, _)| token.0);

        let mut spawned = Vec::new();
        for (token, readiness) in ready {
            let Some(handler) = self.slots.get_mut(token.0) else {
                // Slot vacated earlier in this pass.
                continue;
            };

            let action = if readiness.error {
                handler.on_error(token)
            } else if readiness.read_closed && readiness.write_closed {
                handler.on_close(token)
            } else if readiness.readable {
                handler.on_readable(token)
            } else if readiness.writable {
                handler.on_writable(token)
            } else if readiness.read_closed {
                handler.on_close(token)
            } else {
                Action::Continue
            };

            match action {
                Action::Continue => {}
                Action::Rearm(interest) => self.rearm_or_close(token, interest),
                Action::Spawn(handlers) => spawned.extend(handlers),
                Action::Close => self.close_slot(token),
                Action::Stop => return Ok(Control::Stop),
            }

            self.arm_pending_writers();
        }

        for (handler, interest) in spawned {
            match self.register(handler, interest) {
                Ok(_) => {}
                Err(ReactorError::Busy { capacity }) => {
                    // Dropping the connection closes it; the registry bound
                    // must not become a remote kill switch.
                    warn!(capacity, "handler registry full; dropping accepted connection");
                }
                Err(e) => return Err(e),
            }
        }
        self.arm_pending_writers();

        Ok(Control::Continue)
    }

    fn arm_pending_writers(&mut self) {
        for token in self.wake.take() {
            // The slot may have been torn down after the send was scheduled.
            if self.slots.contains(token.0) {
                self.rearm_or_close(token, Interest::READABLE | Interest::WRITABLE);
            }
        }
    }

    /// A poller failure on one slot is fatal to that connection only: the
    /// slot is torn down and the loop keeps serving.
    fn rearm_or_close(&mut self, token: Token, interest: Interest) {
        if let Err(e) = self.rearm(token, interest) {
            warn!(slot = token.0, error = %e, "rearm failed; closing connection");
            self.close_slot(token);
        }
    }

    /// Moves the handler out of the slot and drops it, once. A failed poller
    /// deregistration is logged and ignored; closing the socket on drop
    /// removes any leftover registration.
    fn close_slot(&mut self, token: Token) {
        match self.deregister(token) {
            Ok(handler) => drop(handler),
            Err(e) => warn!(slot = token.0, error = %e, "deregister failed"),
        }
    }
}
