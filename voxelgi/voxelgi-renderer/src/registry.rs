//! Active-instance registry keyed by host session. Only one volume per session is expected;
//! a second registration is reported and replaces the first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 { self.0 }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `register`, needed to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceToken(u64);

struct Slot<T> {
    token: InstanceToken,
    value: T,
}

pub struct InstanceRegistry<T> {
    active: HashMap<SessionId, Slot<T>>,
    next_token: u64,
}

impl<T> Default for InstanceRegistry<T> {
    fn default() -> Self {
        Self { active: HashMap::new(), next_token: 1 }
    }
}

impl<T> InstanceRegistry<T> {
    pub fn new() -> Self { Self::default() }

    /// Make `value` the active instance for `session`. An existing one is replaced with a warning.
    pub fn register(&mut self, session: SessionId, value: T) -> InstanceToken {
        let token = InstanceToken(self.next_token);
        self.next_token += 1;
        if self.active.contains_key(&session) {
            log::warn!("more than one voxel GI instance registered for session {}; the newest one is used", session.raw());
        }
        self.active.insert(session, Slot { token, value });
        token
    }

    /// Remove the active instance if `token` owns it. Returns whether anything was removed.
    pub fn unregister(&mut self, session: SessionId, token: InstanceToken) -> bool {
        match self.active.get(&session) {
            Some(slot) if slot.token == token => {
                self.active.remove(&session);
                true
            }
            Some(_) => {
                log::warn!("unregister for session {} from an instance that is not active", session.raw());
                false
            }
            None => false,
        }
    }

    pub fn active(&self, session: SessionId) -> Option<&T> {
        self.active.get(&session).map(|s| &s.value)
    }

    /// Update the active value in place if `token` owns it.
    pub fn update(&mut self, session: SessionId, token: InstanceToken, value: T) -> bool {
        match self.active.get_mut(&session) {
            Some(slot) if slot.token == token => {
                slot.value = value;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize { self.active.len() }
    pub fn is_empty(&self) -> bool { self.active.is_empty() }
}
