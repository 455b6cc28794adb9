//! Ordering and business engine for the follow graph.
//!
//! The engine owns two pieces of state: the user registry and the event
//! reorder buffer. Events arrive in arbitrary sequence-number order; the
//! engine queues them and applies effects in strictly ascending, gapless
//! order starting at [`FIRST_SEQNUM`]. A missing sequence number stalls
//! application until it arrives — there is no timeout and no bound other
//! than memory.
//!
//! Users are created lazily (by event reference or client registration) and
//! garbage-collected exactly when "blank": no connected clients, no
//! followers, no followees.
//!
//! The engine is strictly single-threaded. It is driven entirely from the
//! reactor's dispatch loop, so every mutation and every fan-out completes
//! before the next readiness wait; no locking is needed and invariants (such
//! as mutual follower/followee links) are restored before any call returns.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, trace};

use crate::protocol::{self, Event, EventKind, Seqnum, UserId, FIRST_SEQNUM};

/// Outbound half of a connected user client, as the engine sees it.
///
/// `send` must not block: the daemon's implementation appends to a buffer and
/// arms write interest. Equality identifies a client connection so that
/// unregistration can remove exactly one matching occurrence.
pub trait ClientSink {
    fn send(&self, message: &str);
}

/// A user in the registry.
///
/// Follower/followee links are plain ids (weak back-references into the
/// registry); `clients` is an ordered list and may contain the same client
/// more than once — duplicates are matched one-for-one on unregister.
#[derive(Debug)]
pub struct User<C> {
    id: UserId,
    followers: BTreeSet<UserId>,
    followees: BTreeSet<UserId>,
    clients: Vec<C>,
}

impl<C> User<C> {
    fn new(id: UserId) -> Self {
        Self {
            id,
            followers: BTreeSet::new(),
            followees: BTreeSet::new(),
            clients: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> UserId {
        self.id
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn follower_count(&self) -> usize {
        self.followers.len()
    }

    #[must_use]
    pub fn followee_count(&self) -> usize {
        self.followees.len()
    }

    #[must_use]
    pub fn has_follower(&self, id: UserId) -> bool {
        self.followers.contains(&id)
    }

    #[must_use]
    pub fn has_followee(&self, id: UserId) -> bool {
        self.followees.contains(&id)
    }

    fn is_blank(&self) -> bool {
        self.clients.is_empty() && self.followers.is_empty() && self.followees.is_empty()
    }
}

/// The follow-graph engine: user registry plus event reorder buffer.
///
/// Generic over the client sink so the daemon can plug in buffered socket
/// writers and tests can plug in recorders.
pub struct FollowEngine<C> {
    users: BTreeMap<UserId, User<C>>,
    queue: BTreeMap<Seqnum, Event>,
    next_seqnum: Seqnum,
}

impl<C> Default for FollowEngine<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> FollowEngine<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: BTreeMap::new(),
            queue: BTreeMap::new(),
            next_seqnum: FIRST_SEQNUM,
        }
    }

    /// Looks up a user. Present as soon as any event or registration
    /// referenced the id, absent again once the user went blank.
    #[must_use]
    pub fn user(&self, id: UserId) -> Option<&User<C>> {
        self.users.get(&id)
    }

    /// Number of buffered events still waiting for their turn.
    #[must_use]
    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }

    /// The sequence number the engine will apply next.
    #[must_use]
    pub fn next_seqnum(&self) -> Seqnum {
        self.next_seqnum
    }
}

impl<C: ClientSink + PartialEq> FollowEngine<C> {
    /// Ingests raw event-stream text.
    ///
    /// Complete lines are parsed and, if valid, inserted into the reorder
    /// buffer (invalid lines are silently dropped). The unterminated
    /// remainder is left in `events` so the caller can complete it on the
    /// next read. Afterwards, every buffered event whose sequence number
    /// matches the expected counter is applied, in order.
    pub fn ingest(&mut self, events: &mut String) {
        let mut start = 0;
        while let Some(message) = protocol::find_message(events, &mut start) {
            let event = Event::parse(message);
            if event.is_valid() {
                if let Some(seqnum) = event.seqnum {
                    // A duplicate seqnum replaces the queued event; queueing
                    // both could never satisfy the gapless counter.
                    self.queue.insert(seqnum, event);
                }
            } else {
                trace!(payload = message, "dropping invalid event");
            }
        }
        events.drain(..start);

        self.apply_ready();
    }

    /// Registers `client` under the identity found in `input`.
    ///
    /// Consumes the first complete line of `input`; if it parses as a valid
    /// id, the user is looked up or lazily created, the client is appended to
    /// its client list (duplicates allowed), and the id is returned. Returns
    /// `None` when no complete line is available yet or the line is not a
    /// valid id.
    pub fn register_user(&mut self, client: C, input: &str) -> Option<UserId> {
        let mut start = 0;
        let line = protocol::find_message(input, &mut start)?;
        let id = protocol::parse_long(line)?;

        let user = self.users.entry(id).or_insert_with(|| User::new(id));
        user.clients.push(client);
        debug!(user = id, clients = user.clients.len(), "client registered");
        Some(id)
    }

    /// Removes one occurrence of `client` from the user's client list, then
    /// garbage-collects the user if blank. No-op for an unknown id.
    pub fn unregister_user(&mut self, id: UserId, client: &C) {
        let Some(user) = self.users.get_mut(&id) else {
            return;
        };

        if let Some(pos) = user.clients.iter().position(|c| c == client) {
            user.clients.remove(pos);
            debug!(user = id, clients = user.clients.len(), "client unregistered");
        }

        self.collect_if_blank(id);
    }

    /// Discards all queued events, resets the sequence counter, and clears
    /// every follow relation. Users left without clients are removed; users
    /// with connected clients survive, so a reconnecting event source can
    /// restart the stream from 1 without tearing down client registrations.
    pub fn reset(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.next_seqnum = FIRST_SEQNUM;

        self.users.retain(|_, user| {
            user.followers.clear();
            user.followees.clear();
            !user.clients.is_empty()
        });

        info!(
            dropped_events = dropped,
            users = self.users.len(),
            "engine reset"
        );
    }

    fn apply_ready(&mut self) {
        while let Some(entry) = self.queue.first_entry() {
            if *entry.key() != self.next_seqnum {
                break;
            }
            let event = entry.remove();
            trace!(seqnum = self.next_seqnum, "applying event");
            self.apply(&event);
            self.next_seqnum += 1;
        }
    }

    fn apply(&mut self, event: &Event) {
        match event.kind {
            EventKind::Follow => self.handle_follow(event),
            EventKind::Unfollow => self.handle_unfollow(event),
            EventKind::Broadcast => self.handle_broadcast(event),
            EventKind::Private => self.handle_private(event),
            EventKind::StatusUpdate => self.handle_status_update(event),
            // Invalid events are dropped at ingest and never queued.
            EventKind::Invalid => {}
        }
    }

    /// Notify `to` (only if it already existed), then make `from` a follower
    /// of `to`, lazily creating either user without notifying on creation.
    fn handle_follow(&mut self, event: &Event) {
        let (Some(from_id), Some(to_id)) = (event.from_user, event.to_user) else {
            return;
        };

        match self.users.get(&to_id) {
            Some(to_user) => Self::notify(to_user, &event.payload),
            None => {
                self.users.insert(to_id, User::new(to_id));
            }
        }
        self.users.entry(from_id).or_insert_with(|| User::new(from_id));

        if let Some(to_user) = self.users.get_mut(&to_id) {
            to_user.followers.insert(from_id);
        }
        if let Some(from_user) = self.users.get_mut(&from_id) {
            from_user.followees.insert(to_id);
        }
    }

    /// Remove the mutual link, silently ignoring a relation that does not
    /// exist, and garbage-collect either side if it went blank.
    fn handle_unfollow(&mut self, event: &Event) {
        let (Some(from_id), Some(to_id)) = (event.from_user, event.to_user) else {
            return;
        };

        let Some(to_user) = self.users.get_mut(&to_id) else {
            return;
        };
        if !to_user.followers.remove(&from_id) {
            return;
        }
        if let Some(from_user) = self.users.get_mut(&from_id) {
            from_user.followees.remove(&to_id);
        }

        self.collect_if_blank(to_id);
        self.collect_if_blank(from_id);
    }

    /// Notify every registered user, in registry iteration order.
    fn handle_broadcast(&mut self, event: &Event) {
        for user in self.users.values() {
            Self::notify(user, &event.payload);
        }
    }

    /// Notify `to` only, if present. `from` is not lazily created.
    fn handle_private(&mut self, event: &Event) {
        let Some(to_id) = event.to_user else {
            return;
        };
        if let Some(to_user) = self.users.get(&to_id) {
            Self::notify(to_user, &event.payload);
        }
    }

    /// Notify every follower of `from`, in follower-set iteration order.
    fn handle_status_update(&mut self, event: &Event) {
        let Some(from_id) = event.from_user else {
            return;
        };
        let Some(from_user) = self.users.get(&from_id) else {
            return;
        };

        for follower_id in &from_user.followers {
            if let Some(follower) = self.users.get(follower_id) {
                Self::notify(follower, &event.payload);
            }
        }
    }

    /// Encodes the payload once, then delivers it to every client of the
    /// user in list order. This is the only path that feeds client outboxes.
    fn notify(user: &User<C>, payload: &str) {
        let message = protocol::encode_message(payload);
        for client in &user.clients {
            client.send(&message);
        }
    }

    fn collect_if_blank(&mut self, id: UserId) {
        if self.users.get(&id).is_some_and(User::is_blank) {
            self.users.remove(&id);
            debug!(user = id, "blank user removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// Recording sink; equality is by client identity so duplicate
    /// registrations of the same client can be matched one-for-one.
    #[derive(Clone)]
    struct TestClient {
        ident: usize,
        messages: Rc<RefCell<Vec<String>>>,
    }

    impl TestClient {
        fn new(ident: usize) -> Self {
            Self {
                ident,
                messages: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn messages(&self) -> Vec<String> {
            self.messages.borrow().clone()
        }
    }

    impl ClientSink for TestClient {
        fn send(&self, message: &str) {
            self.messages.borrow_mut().push(message.to_owned());
        }
    }

    impl PartialEq for TestClient {
        fn eq(&self, other: &Self) -> bool {
            self.ident == other.ident
        }
    }

    fn ingest(engine: &mut FollowEngine<TestClient>, input: &str) -> String {
        let mut buffer = input.to_owned();
        engine.ingest(&mut buffer);
        buffer
    }

    #[test]
    fn test_register_user() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);

        let id = engine.register_user(client.clone(), "123456\n");
        assert_eq!(id, Some(123456));

        let user = engine.user(123456).unwrap();
        assert_eq!(user.id(), 123456);
        assert_eq!(user.client_count(), 1);

        // Registering the same client again appends a second entry.
        let id = engine.register_user(client.clone(), "123456\n");
        assert_eq!(id, Some(123456));
        assert_eq!(engine.user(123456).unwrap().client_count(), 2);

        engine.unregister_user(123456, &client);
        assert_eq!(engine.user(123456).unwrap().client_count(), 1);

        engine.unregister_user(123456, &client);
        assert!(engine.user(123456).is_none());
    }

    #[test]
    fn test_register_user_incomplete_or_invalid_line() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);

        assert_eq!(engine.register_user(client.clone(), "1234"), None);
        assert_eq!(engine.register_user(client.clone(), "junk\n"), None);
        assert_eq!(engine.register_user(client.clone(), "0\n"), None);
        assert!(engine.user(1234).is_none());
    }

    /// The acceptance transcript: events arrive out of order with a split
    /// trailing message; they are applied in seqnum order, and a broadcast is
    /// delivered once per client registration.
    #[test]
    fn test_events_applied_in_seqnum_order() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);

        engine.register_user(client.clone(), "1\n");
        engine.register_user(client.clone(), "2\n");

        let remainder = ingest(&mut engine, "4|B\n2|F|1|2\n5|U|1|2\n1|P|1");
        assert_eq!(remainder, "1|P|1");

        let completed = format!("{remainder}|2\n3|S|2\n");
        let remainder = ingest(&mut engine, &completed);
        assert_eq!(remainder, "");

        assert_eq!(
            client.messages(),
            vec!["1|P|1|2\n", "2|F|1|2\n", "3|S|2\n", "4|B\n", "4|B\n"]
        );
        assert_eq!(engine.queued_events(), 0);
    }

    #[test]
    fn test_gap_stalls_application() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);
        engine.register_user(client.clone(), "2\n");

        // Seqnum 1 is missing: nothing may be applied.
        ingest(&mut engine, "3|P|1|2\n2|P|1|2\n");
        assert_eq!(engine.queued_events(), 2);
        assert_eq!(engine.next_seqnum(), 1);
        assert!(client.messages().is_empty());

        // Filling the gap releases everything, in order.
        ingest(&mut engine, "1|P|1|2\n");
        assert_eq!(engine.queued_events(), 0);
        assert_eq!(engine.next_seqnum(), 4);
        assert_eq!(
            client.messages(),
            vec!["1|P|1|2\n", "2|P|1|2\n", "3|P|1|2\n"]
        );
    }

    #[test]
    fn test_invalid_events_silently_dropped() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);
        engine.register_user(client.clone(), "2\n");

        ingest(&mut engine, "garbage\n0|B\n123|X|1|2\n1|P|1|2\n");
        assert_eq!(engine.queued_events(), 0);
        assert_eq!(client.messages(), vec!["1|P|1|2\n"]);
    }

    #[test]
    fn test_follow() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);

        // A follow involving only unconnected users notifies nobody but
        // still creates both users and the relation.
        ingest(&mut engine, "1|F|1|2\n");

        engine.register_user(client.clone(), "2\n");
        ingest(&mut engine, "2|F|1|2\n");
        assert_eq!(client.messages(), vec!["2|F|1|2\n"]);

        let user1 = engine.user(1).unwrap();
        assert_eq!(user1.client_count(), 0);
        assert_eq!(user1.follower_count(), 0);
        assert_eq!(user1.followee_count(), 1);
        assert!(user1.has_followee(2));

        let user2 = engine.user(2).unwrap();
        assert_eq!(user2.client_count(), 1);
        assert_eq!(user2.follower_count(), 1);
        assert!(user2.has_follower(1));
        assert_eq!(user2.followee_count(), 0);
    }

    #[test]
    fn test_unfollow() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);

        engine.register_user(client.clone(), "2\n");
        ingest(&mut engine, "1|F|1|2\n");

        // User 1 exists only through the relation; unfollowing makes it
        // blank and it must be collected.
        ingest(&mut engine, "2|U|1|2\n");
        assert!(engine.user(1).is_none());
        let user2 = engine.user(2).unwrap();
        assert_eq!(user2.follower_count(), 0);

        // With a client attached, user 1 survives the unfollow.
        ingest(&mut engine, "3|F|1|2\n");
        engine.register_user(client.clone(), "1\n");
        ingest(&mut engine, "4|U|1|2\n");
        let user1 = engine.user(1).unwrap();
        assert_eq!(user1.followee_count(), 0);
    }

    #[test]
    fn test_unfollow_without_relation_is_noop() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);
        engine.register_user(client.clone(), "2\n");

        ingest(&mut engine, "1|U|1|2\n");
        assert!(engine.user(1).is_none());
        assert!(engine.user(2).is_some());
        assert!(client.messages().is_empty());
    }

    #[test]
    fn test_private() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);

        // Private to an unconnected user is applied (not queued) and ignored.
        ingest(&mut engine, "1|P|1|2\n");
        assert_eq!(engine.queued_events(), 0);

        engine.register_user(client.clone(), "2\n");
        ingest(&mut engine, "2|P|1|2\n");
        assert_eq!(client.messages(), vec!["2|P|1|2\n"]);
        // The sender is not lazily created by a private message.
        assert!(engine.user(1).is_none());
    }

    #[test]
    fn test_status_update() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);

        engine.register_user(client.clone(), "3\n");
        ingest(&mut engine, "1|F|1|3\n2|F|2|3\n");

        // Followers without clients: update applied, nobody notified.
        ingest(&mut engine, "3|S|3\n");
        assert_eq!(engine.queued_events(), 0);

        engine.register_user(client.clone(), "1\n");
        engine.register_user(client.clone(), "2\n");
        ingest(&mut engine, "4|S|3\n");
        assert_eq!(
            client.messages(),
            vec!["1|F|1|3\n", "2|F|2|3\n", "4|S|3\n", "4|S|3\n"]
        );
    }

    #[test]
    fn test_broadcast() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);

        engine.register_user(client.clone(), "1\n");
        engine.register_user(client.clone(), "2\n");
        engine.register_user(client.clone(), "3\n");

        ingest(&mut engine, "1|B\n");
        assert_eq!(client.messages(), vec!["1|B\n", "1|B\n", "1|B\n"]);
    }

    #[test]
    fn test_reset_clears_relations_but_keeps_clients() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);

        engine.register_user(client.clone(), "2\n");
        ingest(&mut engine, "1|F|1|2\n3|B\n");
        assert_eq!(engine.queued_events(), 1);

        engine.reset();

        assert_eq!(engine.queued_events(), 0);
        assert_eq!(engine.next_seqnum(), FIRST_SEQNUM);
        // User 1 had no client and is gone; user 2 keeps its registration
        // but loses its follower.
        assert!(engine.user(1).is_none());
        let user2 = engine.user(2).unwrap();
        assert_eq!(user2.client_count(), 1);
        assert_eq!(user2.follower_count(), 0);

        // The stream restarts from 1.
        ingest(&mut engine, "1|P|1|2\n");
        assert_eq!(client.messages(), vec!["1|F|1|2\n", "1|P|1|2\n"]);
    }

    #[test]
    fn test_mutual_reference_invariant() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);
        engine.register_user(client.clone(), "1\n");
        engine.register_user(client.clone(), "2\n");

        ingest(&mut engine, "1|F|1|2\n");
        assert!(engine.user(2).unwrap().has_follower(1));
        assert!(engine.user(1).unwrap().has_followee(2));

        ingest(&mut engine, "2|U|1|2\n");
        assert!(!engine.user(2).unwrap().has_follower(1));
        assert!(!engine.user(1).unwrap().has_followee(2));
    }

    #[test]
    fn test_duplicate_seqnum_does_not_stall() {
        let mut engine = FollowEngine::new();
        let client = TestClient::new(1);
        engine.register_user(client.clone(), "2\n");

        ingest(&mut engine, "2|P|1|2\n2|P|1|2\n1|P|1|2\n2|P|1|2\n");
        assert_eq!(engine.next_seqnum(), 3);
        assert_eq!(engine.queued_events(), 0);
        assert_eq!(client.messages(), vec!["1|P|1|2\n", "2|P|1|2\n"]);
    }
}
