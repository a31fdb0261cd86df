//! Session registry
//!
//! Sessions are keyed by the connection that created them. Secondary connections and
//! timers are registered as non-owning routes back to that key, so a late event for a
//! detached connection or timer simply finds nothing.

use crate::{ConnId, TimerId};
use std::collections::HashMap;

/// Where an event for a connection should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `conn` owns a session
    Session(ConnId),
    /// `conn` is a secondary connection of the session owned by this id
    Peer(ConnId),
    /// `conn` is not (or no longer) registered
    Unknown,
}

#[derive(Debug)]
pub struct Registry<S> {
    sessions: HashMap<ConnId, S>,
    peers: HashMap<ConnId, ConnId>,
    timers: HashMap<TimerId, ConnId>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            peers: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    pub fn insert(&mut self, owner: ConnId, session: S) {
        self.sessions.insert(owner, session);
    }

    /// Remove a session. Routes pointing at it must be detached separately.
    pub fn remove(&mut self, owner: ConnId) -> Option<S> {
        self.sessions.remove(&owner)
    }

    pub fn get(&self, owner: ConnId) -> Option<&S> {
        self.sessions.get(&owner)
    }

    pub fn get_mut(&mut self, owner: ConnId) -> Option<&mut S> {
        self.sessions.get_mut(&owner)
    }

    pub fn contains(&self, owner: ConnId) -> bool {
        self.sessions.contains_key(&owner)
    }

    pub fn route(&self, conn: ConnId) -> Route {
        if self.sessions.contains_key(&conn) {
            Route::Session(conn)
        } else if let Some(owner) = self.peers.get(&conn) {
            Route::Peer(*owner)
        } else {
            Route::Unknown
        }
    }

    pub fn attach_peer(&mut self, conn: ConnId, owner: ConnId) {
        self.peers.insert(conn, owner);
    }

    pub fn detach_peer(&mut self, conn: ConnId) -> Option<ConnId> {
        self.peers.remove(&conn)
    }

    pub fn attach_timer(&mut self, timer: TimerId, owner: ConnId) {
        self.timers.insert(timer, owner);
    }

    /// Owner of an expired timer. The route is consumed: a timer fires at most once.
    pub fn take_timer(&mut self, timer: TimerId) -> Option<ConnId> {
        self.timers.remove(&timer)
    }

    pub fn detach_timer(&mut self, timer: TimerId) {
        self.timers.remove(&timer);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn owners(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.sessions.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_session_and_peer() {
        let mut registry = Registry::new();
        registry.insert(ConnId(1), "session");
        registry.attach_peer(ConnId(2), ConnId(1));

        assert_eq!(registry.route(ConnId(1)), Route::Session(ConnId(1)));
        assert_eq!(registry.route(ConnId(2)), Route::Peer(ConnId(1)));
        assert_eq!(registry.route(ConnId(3)), Route::Unknown);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_detached_peer_is_unknown() {
        let mut registry = Registry::new();
        registry.insert(ConnId(1), ());
        registry.attach_peer(ConnId(2), ConnId(1));

        assert_eq!(registry.detach_peer(ConnId(2)), Some(ConnId(1)));
        assert_eq!(registry.route(ConnId(2)), Route::Unknown);
        assert_eq!(registry.detach_peer(ConnId(2)), None);
    }

    #[test]
    fn test_timer_fires_once() {
        let mut registry: Registry<()> = Registry::new();
        registry.attach_timer(TimerId(7), ConnId(1));

        assert_eq!(registry.take_timer(TimerId(7)), Some(ConnId(1)));
        assert_eq!(registry.take_timer(TimerId(7)), None);
    }

    #[test]
    fn test_detached_timer_never_routes() {
        let mut registry: Registry<()> = Registry::new();
        registry.attach_timer(TimerId(7), ConnId(1));
        registry.detach_timer(TimerId(7));

        assert_eq!(registry.take_timer(TimerId(7)), None);
    }

    #[test]
    fn test_remove_session() {
        let mut registry = Registry::new();
        registry.insert(ConnId(1), 10u32);
        if let Some(value) = registry.get_mut(ConnId(1)) {
            *value += 1;
        }

        assert_eq!(registry.remove(ConnId(1)), Some(11));
        assert!(registry.is_empty());
        assert_eq!(registry.route(ConnId(1)), Route::Unknown);
    }
}
