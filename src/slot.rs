//! Deferred, single-execution computation behind every map entry.
//!
//! A [`Slot<V, E>`] starts out holding a producer closure and replaces it with
//! the producer's `Result<V, E>` the first time anyone forces it. Whichever
//! thread wins the slot's lock runs the producer; every other thread parks on
//! the slot and reads the same result once it is published. Failures are
//! stored like values, so a failed slot keeps replaying its error instead of
//! running the producer again.
//!
//! Reading a finished slot is a single acquire load; waiting for a running
//! producer parks the thread on the slot's state.

use core::cell::UnsafeCell;
use core::convert::Infallible;
use core::{fmt, mem};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::Timeout;
use crate::state::{SlotGuard, SlotLock};

/// Boxed producer stored in a slot that has not run yet.
pub(crate) type Producer<V, E> = Box<dyn FnOnce() -> Result<V, E> + Send>;

enum SlotState<V, E> {
   /// Producer not started.
   Pending(Producer<V, E>),
   /// Final result of the producer, or a value installed directly.
   Ready(Result<V, E>),
   /// The producer was taken and has not stored a result. Once the slot is
   /// published in this state, the producer panicked.
   Poisoned,
}

/// A lazily computed `Result<V, E>` whose producer runs at most once.
///
/// Slots are what [`LazyMap`](crate::LazyMap) stores per key. They are handed
/// out as `Arc<Slot<V, E>>` so callers can compare slot identities, and they
/// can also be used on their own.
///
/// # Examples
///
/// ```rust
/// use lazy_map::Slot;
///
/// let slot: Slot<String, &str> = Slot::new(|| Ok("ready".to_string()));
/// assert!(!slot.is_done());
/// assert_eq!(slot.force(), Ok("ready".to_string()));
/// assert!(slot.is_done());
/// ```
pub struct Slot<V, E = Infallible> {
   state: UnsafeCell<SlotState<V, E>>,
   lock: SlotLock,
}

impl<V, E> Slot<V, E> {
   /// Creates a slot that runs `producer` the first time it is forced.
   #[inline]
   #[must_use]
   pub fn new<F>(producer: F) -> Self
   where
      F: FnOnce() -> Result<V, E> + Send + 'static,
   {
      Self::from_producer(Box::new(producer))
   }

   #[inline]
   pub(crate) fn from_producer(producer: Producer<V, E>) -> Self {
      Self {
         lock: SlotLock::new(),
         state: UnsafeCell::new(SlotState::Pending(producer)),
      }
   }

   /// Creates a slot that is already finished with `value`.
   #[inline]
   #[must_use]
   pub const fn with_value(value: V) -> Self {
      Self::with_result(Ok(value))
   }

   /// Creates a slot that is already finished with `result`.
   #[inline]
   #[must_use]
   pub const fn with_result(result: Result<V, E>) -> Self {
      Self {
         lock: SlotLock::done(),
         state: UnsafeCell::new(SlotState::Ready(result)),
      }
   }

   /// Checks whether the slot holds its final state.
   ///
   /// This method never blocks.
   #[inline]
   pub fn is_done(&self) -> bool {
      self.lock.is_done()
   }

   /// Checks whether the slot's producer panicked.
   ///
   /// This method never blocks.
   #[inline]
   pub fn is_poisoned(&self) -> bool {
      // SAFETY: DONE was observed with acquire ordering; the state is frozen.
      self.is_done() && matches!(unsafe { &*self.state.get() }, SlotState::Poisoned)
   }

   /// Returns the finished result by reference.
   ///
   /// Returns `None` while the producer has not run or is still running, and
   /// for a poisoned slot. This method never blocks.
   #[inline]
   pub fn peek(&self) -> Option<Result<&V, &E>> {
      if !self.is_done() {
         return None;
      }
      // SAFETY: DONE was observed with acquire ordering; the state is frozen.
      match unsafe { &*self.state.get() } {
         SlotState::Ready(result) => Some(result.as_ref()),
         _ => None,
      }
   }

   /// Runs the producer while holding the guard and publishes the outcome.
   #[cold]
   fn realize(&self, guard: SlotGuard<'_>) {
      // SAFETY: The guard gives us exclusive access to the state until it drops.
      let taken = mem::replace(unsafe { &mut *self.state.get() }, SlotState::Poisoned);
      let SlotState::Pending(producer) = taken else {
         unreachable!("slot locked for production without a pending producer");
      };

      trace!("running slot producer");
      // If the producer unwinds, the guard still publishes and the slot stays poisoned.
      let result = producer();
      trace!(ok = result.is_ok(), "slot producer finished");

      // SAFETY: Still exclusive, the guard has not dropped yet.
      unsafe { *self.state.get() = SlotState::Ready(result) };
      drop(guard);
   }
}

impl<V: Clone, E: Clone> Slot<V, E> {
   /// Clones the published result out of the slot, or `None` if it is poisoned.
   ///
   /// Must only be called after `is_done` returned `true` or a lock attempt
   /// reported the slot finished.
   fn try_read(&self) -> Option<Result<V, E>> {
      debug_assert!(self.is_done(), "read called on an unfinished slot");
      // SAFETY: The slot is published and never written again.
      match unsafe { &*self.state.get() } {
         SlotState::Ready(result) => Some(result.clone()),
         SlotState::Poisoned => None,
         SlotState::Pending(_) => unreachable!("published slot still holds its producer"),
      }
   }

   fn read(&self) -> Result<V, E> {
      match self.try_read() {
         Some(result) => result,
         None => panic!("slot producer panicked; the slot is poisoned"),
      }
   }

   /// Waits for (or runs) the producer without reading the result.
   #[inline]
   fn settle(&self) {
      if !self.is_done() {
         if let Some(guard) = self.lock.lock() {
            self.realize(guard);
         }
      }
   }

   /// Returns the slot's result, running the producer if nobody has yet.
   ///
   /// If another thread is running the producer, blocks until it finishes.
   /// Every caller receives a clone of the same result.
   ///
   /// # Panics
   ///
   /// Panics if the producer panicked, now or in an earlier call.
   #[inline]
   pub fn force(&self) -> Result<V, E> {
      self.settle();
      self.read()
   }

   /// Like [`force`](Self::force), but returns `None` for a poisoned slot
   /// instead of panicking.
   ///
   /// A producer that this call runs and that panics still unwinds through
   /// the caller.
   #[inline]
   pub fn try_force(&self) -> Option<Result<V, E>> {
      self.settle();
      self.try_read()
   }

   /// Like [`force`](Self::force), but stops waiting for another thread's
   /// producer after `timeout`.
   ///
   /// A producer started by this call always runs to completion; the timeout
   /// only bounds the time spent parked.
   pub fn force_timeout(&self, timeout: Duration) -> Result<Result<V, E>, Timeout> {
      if !self.is_done() {
         let guard = match Instant::now().checked_add(timeout) {
            Some(deadline) => self.lock.lock_until(deadline)?,
            None => self.lock.lock(),
         };
         if let Some(guard) = guard {
            self.realize(guard);
         }
      }
      Ok(self.read())
   }

   /// Async variant of [`force`](Self::force).
   ///
   /// Waiting yields to the runtime instead of parking the worker thread. The
   /// producer itself is synchronous and runs on the task that wins the slot.
   #[cfg(any(feature = "async-tokio", feature = "async-tokio-mt"))]
   pub async fn force_async(&self) -> Result<V, E> {
      if !self.is_done() {
         if let Some(guard) = self.lock.lock_async().await {
            self.realize(guard);
         }
      }
      self.read()
   }
}

// SAFETY:
// Shared access only ever reads `Ready` results after the slot is published,
// which requires `V: Sync` and `E: Sync`. The producer is moved out and run by
// exactly one thread, which may differ from the creating thread, so `V`, `E`
// and the (already `Send`) producer must be `Send`.
unsafe impl<V: Send + Sync, E: Send + Sync> Sync for Slot<V, E> {}

impl<V, E> From<V> for Slot<V, E> {
   /// Creates a finished slot holding `value`.
   #[inline]
   fn from(value: V) -> Self {
      Self::with_value(value)
   }
}

impl<V: fmt::Debug, E: fmt::Debug> fmt::Debug for Slot<V, E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_tuple("Slot");
      match self.peek() {
         Some(result) => d.field(&result),
         None if self.is_poisoned() => d.field(&format_args!("<poisoned>")),
         None => d.field(&format_args!("<pending>")),
      };
      d.finish()
   }
}
