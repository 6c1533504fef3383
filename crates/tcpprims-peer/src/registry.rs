use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::id::ConnectionId;

/// Maps connection identifiers to live connection entries.
///
/// Identifiers come from a monotonically increasing counter. On wrap-around
/// the counter skips reserved values and any identifier still held, so two
/// live entries never share an id and an id is only reused after its entry
/// has been removed.
///
/// The map is internally locked, so reader threads, caller threads and an
/// event-loop thread can add, look up and remove concurrently. Closures
/// passed to [`with_entry`](Registry::with_entry) and
/// [`for_each`](Registry::for_each) run under that lock and must not call
/// back into the same registry.
pub struct Registry<E> {
    entries: Mutex<HashMap<ConnectionId, E>>,
    next_id: AtomicU32,
}

impl<E> Default for Registry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Registry<E> {
    /// Create an empty registry; the first id issued is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(first),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConnectionId, E>> {
        // A panicking callback must not take the whole transport down with it.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue(&self, entries: &HashMap<ConnectionId, E>) -> ConnectionId {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
            if ConnectionId::is_reserved(raw) {
                continue;
            }
            let id = ConnectionId::new(raw);
            if !entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Store `entry` under a fresh identifier.
    pub fn add(&self, entry: E) -> ConnectionId {
        self.add_with(|_| entry)
    }

    /// Store the entry built by `make` under a fresh identifier, for entries
    /// that need to know their own id.
    pub fn add_with(&self, make: impl FnOnce(ConnectionId) -> E) -> ConnectionId {
        match self.try_add_with(|id| Ok::<E, Infallible>(make(id))) {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }

    /// Fallible [`add_with`](Registry::add_with); nothing is stored and the
    /// id is discarded when `make` fails.
    pub fn try_add_with<Err>(
        &self,
        make: impl FnOnce(ConnectionId) -> Result<E, Err>,
    ) -> Result<ConnectionId, Err> {
        let mut entries = self.entries();
        let id = self.issue(&entries);
        let entry = make(id)?;
        entries.insert(id, entry);
        Ok(id)
    }

    /// Clone out the entry for `id`.
    pub fn lookup(&self, id: ConnectionId) -> Option<E>
    where
        E: Clone,
    {
        self.entries().get(&id).cloned()
    }

    /// Run `f` against the entry for `id`, if present.
    pub fn with_entry<R>(&self, id: ConnectionId, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        self.entries().get_mut(&id).map(f)
    }

    /// Whether `id` names a live entry.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries().contains_key(&id)
    }

    /// Remove and return the entry for `id`. Unknown ids are a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<E> {
        self.entries().remove(&id)
    }

    /// Visit every live entry.
    pub fn for_each(&self, mut f: impl FnMut(ConnectionId, &E)) {
        for (id, entry) in self.entries().iter() {
            f(*id, entry);
        }
    }

    /// Remove every entry, returning them in id order.
    pub fn drain(&self) -> Vec<(ConnectionId, E)> {
        let mut drained: Vec<_> = self.entries().drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    /// Live identifiers in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.entries().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no entries are live.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl<E> std::fmt::Debug for Registry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("live", &self.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn issues_increasing_ids_from_one() {
        let registry = Registry::new();
        let a = registry.add("a");
        let b = registry.add("b");
        assert_eq!(a.as_u32(), 1);
        assert_eq!(b.as_u32(), 2);
        assert_eq!(registry.lookup(a), Some("a"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let id = registry.add(10u8);

        assert_eq!(registry.remove(id), Some(10));
        assert_eq!(registry.remove(id), None);
        assert!(registry.lookup(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn add_with_sees_its_own_id() {
        let registry = Registry::new();
        let id = registry.add_with(|id| id.as_u32() * 10);
        assert_eq!(registry.lookup(id), Some(id.as_u32() * 10));
    }

    #[test]
    fn failed_try_add_stores_nothing() {
        let registry: Registry<u8> = Registry::new();
        let result = registry.try_add_with(|_| Err("nope"));
        assert_eq!(result, Err("nope"));
        assert!(registry.is_empty());
    }

    #[test]
    fn wrap_around_skips_reserved_and_live_ids() {
        let registry = Registry::starting_at(u32::MAX - 2);
        let live_low = ConnectionId::new(1);
        registry.entries().insert(live_low, "old");

        let a = registry.add("a");
        let b = registry.add("b");
        let c = registry.add("c");

        assert_eq!(a.as_u32(), u32::MAX - 2);
        assert_eq!(b.as_u32(), u32::MAX - 1);
        assert_eq!(c.as_u32(), 2, "0, u32::MAX and live id 1 must be skipped");
        assert_eq!(registry.lookup(live_low), Some("old"));
    }

    #[test]
    fn ids_are_reused_only_after_removal() {
        let registry = Registry::starting_at(u32::MAX - 1);
        let first = registry.add(1);
        assert_eq!(first.as_u32(), u32::MAX - 1);

        // Counter wraps; with `first` still live the next ids avoid it.
        registry.next_id.store(u32::MAX - 1, Ordering::Relaxed);
        let second = registry.add(2);
        assert_ne!(second, first);

        registry.remove(first);
        registry.next_id.store(u32::MAX - 1, Ordering::Relaxed);
        let third = registry.add(3);
        assert_eq!(third, first);
    }

    #[test]
    fn concurrent_adds_never_collide() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                for i in 0..200u32 {
                    let id = registry.add(t * 1000 + i);
                    mine.push(id);
                    if i % 3 == 0 {
                        registry.remove(id);
                    }
                }
                mine
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "{id} issued twice");
            }
        }
    }

    #[test]
    fn with_entry_mutates_in_place() {
        let registry = Registry::new();
        let id = registry.add(vec![1]);
        assert_eq!(registry.with_entry(id, |v| {
            v.push(2);
            v.len()
        }), Some(2));
        assert_eq!(registry.lookup(id), Some(vec![1, 2]));
        assert!(registry.with_entry(ConnectionId::new(99), |_| ()).is_none());
    }

    #[test]
    fn drain_and_for_each_cover_everything() {
        let registry = Registry::new();
        let ids: Vec<_> = (0..5).map(|n| registry.add(n)).collect();

        let mut seen = Vec::new();
        registry.for_each(|id, _| seen.push(id));
        seen.sort();
        assert_eq!(seen, ids);
        assert_eq!(registry.ids(), ids);

        let drained = registry.drain();
        assert_eq!(drained.len(), 5);
        assert_eq!(drained[0].0, ids[0]);
        assert!(registry.is_empty());
    }
}
