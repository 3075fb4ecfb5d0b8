//! Per-slot synchronization state.
//!
//! Every [`Slot`](crate::Slot) carries one [`SlotLock`], a state machine packed
//! into a single `AtomicU8` and parked on through `parking_lot_core`:
//! - Bit 0: DONE - The slot holds its final state
//! - Bit 1: LOCKED - A thread is running the slot's producer
//! - Bit 2: WAITING - At least one thread is parked on the slot
//! - Bits 3-7: EPOCH - Generation counter, bumped on every publish
//!
//! Readers of a finished slot only perform an acquire load. Threads that arrive
//! while the producer runs park on the address of the atomic and are woken when
//! the guard publishes.

use core::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

use crate::error::Timeout;

/// Atomic state of a single slot.
#[repr(transparent)]
pub(crate) struct SlotLock(AtomicU8);

impl SlotLock {
   /// Bit flag: slot is finished.
   const DONE: u8 = 1;
   /// Bit flag: producer is running.
   const LOCKED: u8 = 2;
   /// Bit flag: at least one thread is parked.
   const WAITING: u8 = 4;
   /// Start of epoch bits.
   const EPOCH_1: u8 = 8;
   /// Mask for epoch bits.
   const EPOCH_MASK: u8 = !(Self::DONE | Self::LOCKED | Self::WAITING);

   #[inline(always)]
   const fn next_epoch(current_state: u8) -> u8 {
      (current_state & Self::EPOCH_MASK).wrapping_add(Self::EPOCH_1) & Self::EPOCH_MASK
   }

   /// Creates the state of a slot whose producer has not started.
   #[inline]
   pub(crate) const fn new() -> Self {
      Self(AtomicU8::new(0))
   }

   /// Creates the state of a slot that was installed with a ready value.
   #[inline]
   pub(crate) const fn done() -> Self {
      Self(AtomicU8::new(Self::DONE))
   }

   #[inline]
   fn notify_all(&self) {
      // SAFETY: The address passed to unpark matches the one used by `park`.
      unsafe {
         parking_lot_core::unpark_all(self.0.as_ptr() as usize, DEFAULT_UNPARK_TOKEN);
      }
   }

   /// Parks until the state moves away from `expected_state` or `deadline` passes.
   /// Returns `false` only if the deadline elapsed.
   #[inline]
   fn park(&self, expected_state: u8, deadline: Option<Instant>) -> bool {
      // SAFETY: See `notify_all`.
      let result = unsafe {
         parking_lot_core::park(
            self.0.as_ptr() as usize,
            || self.0.load(Ordering::Acquire) == expected_state,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            deadline,
         )
      };
      !matches!(result, ParkResult::TimedOut)
   }

   /// Marks the slot finished, bumps the epoch and wakes parked threads.
   /// Returns `true` if the slot was not finished before.
   #[inline]
   pub(crate) fn set_done(&self) -> bool {
      let current_state = self.0.load(Ordering::Relaxed);
      let new_state = Self::DONE | Self::next_epoch(current_state);

      // Release pairs with the acquire loads in `is_done` and `lock_step`, so the
      // producer's write to the slot is visible to every reader that sees DONE.
      let prev_state = self.0.swap(new_state, Ordering::Release);
      if prev_state & Self::WAITING != 0 {
         self.notify_all();
      }
      prev_state & Self::DONE == 0
   }

   #[inline]
   pub(crate) fn is_done(&self) -> bool {
      self.0.load(Ordering::Acquire) & Self::DONE != 0
   }

   /// One attempt at taking the producer lock.
   ///
   /// - `Ok(None)`: the slot is finished.
   /// - `Ok(Some(guard))`: the caller won and must run the producer.
   /// - `Err(state)`: another thread holds the lock; `state` has WAITING set.
   #[inline]
   fn lock_step(&self) -> Result<Option<SlotGuard<'_>>, u8> {
      loop {
         let current_state = self.0.load(Ordering::Acquire);
         if current_state & Self::DONE != 0 {
            return Ok(None);
         }

         if current_state & Self::LOCKED == 0 {
            match self.0.compare_exchange_weak(
               current_state,
               current_state | Self::LOCKED,
               Ordering::Acquire,
               Ordering::Relaxed,
            ) {
               Ok(_) => return Ok(Some(SlotGuard::new(self))),
               Err(_) => {
                  std::hint::spin_loop();
                  continue;
               }
            }
         }

         if current_state & Self::WAITING == 0 {
            let new_state = current_state | Self::WAITING;
            match self.0.compare_exchange_weak(
               current_state,
               new_state,
               Ordering::Relaxed,
               Ordering::Relaxed,
            ) {
               Ok(_) => return Err(new_state),
               Err(_) => {
                  std::hint::spin_loop();
                  continue;
               }
            }
         }
         return Err(current_state);
      }
   }

   /// Takes the producer lock, parking while another thread holds it.
   ///
   /// Returns `None` once the slot is finished.
   #[inline]
   pub(crate) fn lock(&self) -> Option<SlotGuard<'_>> {
      loop {
         match self.lock_step() {
            Ok(guard_opt) => return guard_opt,
            Err(state) => {
               self.park(state, None);
            }
         }
      }
   }

   /// Like [`lock`](Self::lock), but gives up once `deadline` passes while
   /// another thread still holds the lock.
   pub(crate) fn lock_until(&self, deadline: Instant) -> Result<Option<SlotGuard<'_>>, Timeout> {
      loop {
         match self.lock_step() {
            Ok(guard_opt) => return Ok(guard_opt),
            Err(state) => {
               if !self.park(state, Some(deadline)) {
                  // The holder may have published right at the deadline.
                  return self.lock_step().map_err(|_| Timeout);
               }
            }
         }
      }
   }

   /// Takes the producer lock from async code.
   ///
   /// Yields to the runtime while the holder works. On a multi-threaded tokio
   /// runtime it then falls back to parking the worker under `block_in_place`;
   /// anywhere else (current-thread runtime, foreign executor) it keeps yielding.
   #[cfg(any(feature = "async-tokio", feature = "async-tokio-mt"))]
   pub(crate) async fn lock_async(&self) -> Option<SlotGuard<'_>> {
      loop {
         for _ in 0..16 {
            match self.lock_step() {
               Ok(guard_opt) => return guard_opt,
               Err(state) => {
                  for _ in 0..32 {
                     tokio::task::yield_now().await;
                     if self.0.load(Ordering::Relaxed) != state {
                        break;
                     }
                  }
               }
            }
         }

         #[cfg(feature = "async-tokio-mt")]
         if can_block_in_place() {
            return match self.lock_step() {
               Ok(guard_opt) => guard_opt,
               Err(state) => tokio::task::block_in_place(|| {
                  self.park(state, None);
                  self.lock()
               }),
            };
         }
      }
   }
}

/// `block_in_place` panics outside a multi-threaded runtime.
#[cfg(feature = "async-tokio-mt")]
fn can_block_in_place() -> bool {
   use tokio::runtime::{Handle, RuntimeFlavor};

   Handle::try_current().is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread)
}

/// Proof that the holder is the single thread running a slot's producer.
///
/// Dropping the guard publishes the slot, whether the producer returned or
/// unwound. The slot writes its final state before the guard goes away.
pub(crate) struct SlotGuard<'a> {
   state: &'a SlotLock,
}

impl<'a> SlotGuard<'a> {
   #[inline(always)]
   const fn new(state: &'a SlotLock) -> Self {
      Self { state }
   }
}

impl Drop for SlotGuard<'_> {
   #[inline(always)]
   fn drop(&mut self) {
      self.state.set_done();
   }
}
