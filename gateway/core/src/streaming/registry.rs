//! Cancellation Registry
//!
//! Maps a session to the cancellation handle of its in-flight generation.
//! The connection serving a session's event stream and a separate stop
//! request arriving on another connection both reach the same handle through
//! this map, so it must live for as long as the serving process does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::messages::SessionId;

/// A registered generation
#[derive(Clone, Debug)]
pub struct Registration {
    /// Unique per registration; guards against releasing a newer entry
    pub generation: u64,
    /// Handle observed by the dispatcher
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    active: DashMap<SessionId, Registration>,
    next_generation: AtomicU64,
}

/// Shared session → cancellation handle map
#[derive(Clone, Debug, Default)]
pub struct CancellationRegistry {
    inner: Arc<Inner>,
}

impl CancellationRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh handle for `session_id`
    ///
    /// Returns `None` if the session already has one, which makes the check
    /// and the insert a single atomic step.
    pub fn register(&self, session_id: &SessionId) -> Option<Registration> {
        match self.inner.active.entry(session_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let registration = Registration {
                    generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
                    token: CancellationToken::new(),
                };
                slot.insert(registration.clone());
                Some(registration)
            }
        }
    }

    /// Signal cancellation; `false` if nothing was in flight
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.inner.active.get(session_id) {
            Some(registration) => {
                registration.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the entry, but only if it still belongs to `registration`
    pub fn release(&self, session_id: &SessionId, registration: &Registration) {
        self.inner
            .active
            .remove_if(session_id, |_, current| {
                current.generation == registration.generation
            });
    }

    /// Whether `session_id` has a generation in flight
    #[must_use]
    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.inner.active.contains_key(session_id)
    }

    /// Number of generations in flight
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_single_flight() {
        let registry = CancellationRegistry::new();
        let id = SessionId::from("s1");

        let registration = registry.register(&id).unwrap();
        assert!(registry.register(&id).is_none());
        assert!(registry.is_active(&id));
        assert_eq!(registry.active_count(), 1);

        registry.release(&id, &registration);
        assert!(!registry.is_active(&id));
        assert!(registry.register(&id).is_some());
    }

    #[test]
    fn test_stale_release_keeps_newer_entry() {
        let registry = CancellationRegistry::new();
        let id = SessionId::from("s1");

        let old = registry.register(&id).unwrap();
        registry.release(&id, &old);
        let _new = registry.register(&id).unwrap();

        registry.release(&id, &old);
        assert!(registry.is_active(&id));
    }

    #[test]
    fn test_cancel_reaches_registered_token() {
        let registry = CancellationRegistry::new();
        let id = SessionId::from("s1");
        let registration = registry.register(&id).unwrap();

        assert!(registry.cancel(&id));
        assert!(registration.token.is_cancelled());
        assert!(!registry.cancel(&SessionId::from("other")));
    }
}
