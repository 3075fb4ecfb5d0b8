//! Concurrent map with lazily computed, single-flight values.
//!
//! [`LazyMap`] stores an `Arc<Slot>` per key instead of a raw value. Installing
//! a slot is an atomic insert-if-absent on the backing `DashMap` and only holds
//! a shard lock for the duration of that insert. Running the producer happens
//! afterwards, outside every map lock, under the slot's own lock. Threads that
//! race on the same key therefore converge on one installed slot, and only that
//! slot's producer executes.

use core::borrow::Borrow;
use core::convert::Infallible;
use core::fmt;
use core::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use std::vec;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::Timeout;
use crate::slot::{Producer, Slot};

/// A thread-safe map whose values are produced lazily, at most once per slot.
///
/// Values are returned by clone, so `V` is usually cheap to clone (an `Arc`
/// around a resource, an id, a small struct). Producer failures of type `E`
/// are cached in the slot like values and cloned to every reader; to retry,
/// remove or replace the key.
///
/// A producer must not force the key it is producing: that blocks forever.
///
/// # Examples
///
/// ```rust
/// use lazy_map::LazyMap;
///
/// let map: LazyMap<&str, usize, String> = LazyMap::new();
/// assert_eq!(map.get_or_add("answer", |_| Ok(42)), Ok(42));
/// // The slot is already finished, so this factory is never called.
/// assert_eq!(map.get_or_add("answer", |_| Ok(0)), Ok(42));
/// assert_eq!(map.try_get("missing"), None);
/// ```
pub struct LazyMap<K, V, E = Infallible> {
   slots: DashMap<K, Arc<Slot<V, E>>>,
}

/// Wraps a key-taking factory into a slot producer that owns its key.
fn bind<K, V, E, F>(key: K, factory: F) -> Producer<V, E>
where
   K: Send + 'static,
   V: 'static,
   E: 'static,
   F: FnOnce(&K) -> Result<V, E> + Send + 'static,
{
   Box::new(move || factory(&key))
}

impl<K, V, E> LazyMap<K, V, E>
where
   K: Eq + Hash + Clone,
{
   /// Creates an empty map.
   #[inline]
   #[must_use]
   pub fn new() -> Self {
      Self {
         slots: DashMap::new(),
      }
   }

   /// Creates an empty map with room for at least `capacity` keys.
   #[inline]
   #[must_use]
   pub fn with_capacity(capacity: usize) -> Self {
      Self {
         slots: DashMap::with_capacity(capacity),
      }
   }

   /// Number of keys, including keys whose producer has not finished.
   #[inline]
   pub fn len(&self) -> usize {
      self.slots.len()
   }

   #[inline]
   pub fn is_empty(&self) -> bool {
      self.slots.is_empty()
   }

   /// Checks whether a slot is installed for `key`. Never realizes it.
   #[inline]
   pub fn contains_key<Q>(&self, key: &Q) -> bool
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      self.slots.contains_key(key)
   }

   /// Returns the slot installed for `key` without realizing it.
   ///
   /// The returned handle identifies this exact installation and can be passed
   /// to [`try_remove_slot`](Self::try_remove_slot).
   #[inline]
   pub fn slot<Q>(&self, key: &Q) -> Option<Arc<Slot<V, E>>>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      // Clone the handle so the shard lock is released before anyone blocks on it.
      self.slots.get(key).map(|slot| Arc::clone(slot.value()))
   }

   /// Removes every key. Realizations already in flight finish on their own.
   pub fn clear(&self) {
      self.slots.clear();
      debug!("cleared lazy map");
   }
}

impl<K, V, E> LazyMap<K, V, E>
where
   K: Eq + Hash + Clone + fmt::Debug,
{
   /// Installs `slot` for `key`, returning the slot it replaced.
   fn install(&self, key: K, slot: Slot<V, E>) -> Option<Arc<Slot<V, E>>> {
      match self.slots.entry(key) {
         Entry::Occupied(mut entry) => {
            debug!(key = ?entry.key(), replaced = true, "installed slot");
            Some(entry.insert(Arc::new(slot)))
         }
         Entry::Vacant(entry) => {
            debug!(key = ?entry.key(), replaced = false, "installed slot");
            entry.insert(Arc::new(slot));
            None
         }
      }
   }

   /// Unconditionally associates `key` with a finished slot holding `value`.
   ///
   /// Readers that already captured the previous slot still get its result.
   /// Returns the replaced slot, if any.
   pub fn set(&self, key: K, value: V) -> Option<Arc<Slot<V, E>>> {
      self.install(key, Slot::with_value(value))
   }

   /// Unconditionally associates `key` with a new slot that runs `factory` on
   /// first access.
   ///
   /// The factory is not called here. Returns the replaced slot, if any.
   pub fn set_with<F>(&self, key: K, factory: F) -> Option<Arc<Slot<V, E>>>
   where
      K: Send + 'static,
      V: 'static,
      E: 'static,
      F: FnOnce(&K) -> Result<V, E> + Send + 'static,
   {
      let producer = bind(key.clone(), factory);
      self.install(key, Slot::from_producer(producer))
   }

   /// Removes the slot for `key` only if it is still the slot `expected`.
   ///
   /// Returns `true` if it was removed. The removed slot is not realized.
   pub fn try_remove_slot<Q>(&self, key: &Q, expected: &Arc<Slot<V, E>>) -> bool
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      match self.slots.remove_if(key, |_, slot| Arc::ptr_eq(slot, expected)) {
         Some((key, _)) => {
            debug!(key = ?key, "removed observed slot");
            true
         }
         None => false,
      }
   }

   /// Returns the slot for `key`, installing one built from `factory` if the
   /// key is absent. Never runs the factory.
   fn get_or_install<F>(&self, key: K, factory: F) -> Arc<Slot<V, E>>
   where
      K: Send + 'static,
      V: 'static,
      E: 'static,
      F: FnOnce(&K) -> Result<V, E> + Send + 'static,
   {
      if let Some(slot) = self.slot(&key) {
         return slot;
      }
      match self.slots.entry(key) {
         Entry::Occupied(entry) => Arc::clone(entry.get()),
         Entry::Vacant(entry) => {
            let producer = bind(entry.key().clone(), factory);
            let slot = Arc::new(Slot::from_producer(producer));
            debug!(key = ?entry.key(), "installed lazy slot");
            entry.insert(Arc::clone(&slot));
            slot
         }
      }
   }

   /// Swaps in `candidate` if the slot for `key` is still `expected`
   /// (`None` meaning the key must be absent).
   fn replace_if(
      &self,
      key: &K,
      expected: Option<&Arc<Slot<V, E>>>,
      candidate: &Arc<Slot<V, E>>,
   ) -> bool {
      match (self.slots.entry(key.clone()), expected) {
         (Entry::Vacant(entry), None) => {
            entry.insert(Arc::clone(candidate));
            true
         }
         (Entry::Occupied(mut entry), Some(expected)) if Arc::ptr_eq(entry.get(), expected) => {
            entry.insert(Arc::clone(candidate));
            true
         }
         _ => false,
      }
   }
}

impl<K, V, E> LazyMap<K, V, E>
where
   K: Eq + Hash + Clone + fmt::Debug,
   V: Clone,
   E: Clone,
{
   /// Returns the value for `key`, producing it with `factory` if the key is
   /// absent.
   ///
   /// However many threads call this concurrently for a missing key, exactly
   /// one slot is installed and its factory runs once; all callers receive the
   /// same result. If the key is present, `factory` is dropped unused.
   ///
   /// # Panics
   ///
   /// Panics if the slot's producer panicked.
   pub fn get_or_add<F>(&self, key: K, factory: F) -> Result<V, E>
   where
      K: Send + 'static,
      V: 'static,
      E: 'static,
      F: FnOnce(&K) -> Result<V, E> + Send + 'static,
   {
      self.get_or_install(key, factory).force()
   }

   /// Adds a value with `add` if `key` is absent, otherwise installs a new slot
   /// producing `update(&key, &current)`.
   ///
   /// The new slot is installed with a compare-and-swap against the slot that
   /// was read. An updater that loses the race discards its candidate slot
   /// without running it and retries against the winner's slot, which is why
   /// `update` is `Fn`. A current slot holding a failure counts as absent and
   /// is replaced by the `add` slot.
   ///
   /// # Panics
   ///
   /// Panics if the current or the installed slot's producer panicked.
   pub fn add_or_update<A, U>(&self, key: K, add: A, update: U) -> Result<V, E>
   where
      K: Send + 'static,
      V: Send + 'static,
      E: 'static,
      A: FnOnce(&K) -> Result<V, E> + Send + 'static,
      U: Fn(&K, &V) -> Result<V, E> + Send + Sync + 'static,
   {
      let update = Arc::new(update);
      let add_slot = Arc::new(Slot::from_producer(bind(key.clone(), add)));
      loop {
         let current = self.slot(&key);
         let candidate = match current.as_ref().map(|slot| slot.force()) {
            Some(Ok(value)) => {
               let update = Arc::clone(&update);
               let key = key.clone();
               Arc::new(Slot::new(move || update(&key, &value)))
            }
            Some(Err(_)) | None => Arc::clone(&add_slot),
         };
         if self.replace_if(&key, current.as_ref(), &candidate) {
            debug!(key = ?key, updated = current.is_some(), "add_or_update installed slot");
            return candidate.force();
         }
         trace!(key = ?key, "add_or_update lost the install race, retrying");
      }
   }

   /// Returns the value for `key` without ever installing a slot.
   ///
   /// Returns `None` immediately if the key is absent. If the slot's producer
   /// is running, blocks until it finishes; if it has not started (see
   /// [`set_with`](Self::set_with)), runs it.
   ///
   /// # Panics
   ///
   /// Panics if the slot's producer panicked.
   #[inline]
   pub fn try_get<Q>(&self, key: &Q) -> Option<Result<V, E>>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      self.slot(key).map(|slot| slot.force())
   }

   /// Like [`try_get`](Self::try_get), but waits at most `timeout` for a
   /// producer running on another thread.
   pub fn try_get_timeout<Q>(&self, key: &Q, timeout: Duration) -> Result<Option<Result<V, E>>, Timeout>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      match self.slot(key) {
         Some(slot) => slot.force_timeout(timeout).map(Some),
         None => Ok(None),
      }
   }

   /// Atomically detaches the slot for `key` and returns its result, waiting
   /// for (or running) its producer first.
   ///
   /// Returns `None` if the key is absent. A poisoned slot is detached as well
   /// and also yields `None`, so removal is how a poisoned key is cleared.
   pub fn try_remove<Q>(&self, key: &Q) -> Option<Result<V, E>>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      let (key, slot) = self.slots.remove(key)?;
      debug!(key = ?key, poisoned = slot.is_poisoned(), "removed slot");
      slot.try_force()
   }

   /// Snapshot of the keys.
   ///
   /// Weakly consistent: keys added or removed concurrently may or may not
   /// appear. No lock is held while the returned iterator is consumed.
   pub fn keys(&self) -> Keys<K> {
      let keys: Vec<K> = self.slots.iter().map(|slot| slot.key().clone()).collect();
      Keys {
         inner: keys.into_iter(),
      }
   }

   /// Snapshot of the entries, realizing each value as the iterator reaches it.
   ///
   /// The set of slots is captured up front with the same weak consistency as
   /// [`keys`](Self::keys); values are forced lazily, so an unfinished slot
   /// blocks `next` until its producer is done. Poisoned slots are skipped.
   pub fn entries(&self) -> Entries<K, V, E> {
      let slots: Vec<(K, Arc<Slot<V, E>>)> = self
         .slots
         .iter()
         .map(|slot| (slot.key().clone(), Arc::clone(slot.value())))
         .collect();
      Entries {
         inner: slots.into_iter(),
      }
   }

   /// Async variant of [`get_or_add`](Self::get_or_add). Waiting for another
   /// task's producer yields to the runtime.
   #[cfg(any(feature = "async-tokio", feature = "async-tokio-mt"))]
   pub async fn get_or_add_async<F>(&self, key: K, factory: F) -> Result<V, E>
   where
      K: Send + 'static,
      V: 'static,
      E: 'static,
      F: FnOnce(&K) -> Result<V, E> + Send + 'static,
   {
      self.get_or_install(key, factory).force_async().await
   }

   /// Async variant of [`try_get`](Self::try_get).
   #[cfg(any(feature = "async-tokio", feature = "async-tokio-mt"))]
   pub async fn try_get_async<Q>(&self, key: &Q) -> Option<Result<V, E>>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      let slot = self.slot(key)?;
      Some(slot.force_async().await)
   }
}

// --- Iterators ---

/// Iterator over a snapshot of a [`LazyMap`]'s keys.
pub struct Keys<K> {
   inner: vec::IntoIter<K>,
}

impl<K> Iterator for Keys<K> {
   type Item = K;

   #[inline]
   fn next(&mut self) -> Option<K> {
      self.inner.next()
   }

   #[inline]
   fn size_hint(&self) -> (usize, Option<usize>) {
      self.inner.size_hint()
   }
}

impl<K> ExactSizeIterator for Keys<K> {}

/// Iterator over a snapshot of a [`LazyMap`]'s entries.
///
/// Yields each key with its slot's result. Forcing happens in `next`; keys
/// whose slot is poisoned are skipped.
pub struct Entries<K, V, E> {
   inner: vec::IntoIter<(K, Arc<Slot<V, E>>)>,
}

impl<K, V: Clone, E: Clone> Iterator for Entries<K, V, E> {
   type Item = (K, Result<V, E>);

   fn next(&mut self) -> Option<Self::Item> {
      self.inner
         .find_map(|(key, slot)| slot.try_force().map(|result| (key, result)))
   }

   #[inline]
   fn size_hint(&self) -> (usize, Option<usize>) {
      (0, self.inner.size_hint().1)
   }
}

// --- Trait Implementations ---

impl<K: Eq + Hash + Clone, V, E> Default for LazyMap<K, V, E> {
   #[inline]
   fn default() -> Self {
      Self::new()
   }
}

impl<K: Eq + Hash + Clone, V, E> FromIterator<(K, V)> for LazyMap<K, V, E> {
   /// Builds a map of finished slots.
   fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
      let map = Self::new();
      for (key, value) in iter {
         map.slots.insert(key, Arc::new(Slot::with_value(value)));
      }
      map
   }
}

impl<K: Eq + Hash + fmt::Debug, V: fmt::Debug, E: fmt::Debug> fmt::Debug for LazyMap<K, V, E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_map();
      for slot in self.slots.iter() {
         d.entry(slot.key(), slot.value());
      }
      d.finish()
   }
}
