//! A concurrent map whose values are produced lazily and at most once per key.
//!
//! This crate provides two layers:
//!
//! - [`LazyMap<K, V, E>`]: a thread-safe map that stores a deferred computation
//!   per key. However many threads race to populate a missing key, exactly one
//!   producer runs and every caller receives its result.
//! - [`ServiceRegistry`] with [`ServiceResolver`]: a typed store holding one
//!   instance per concrete service type, plus a hook for choosing which
//!   registered implementation serves a request.
//!
//! Single execution matters when producing a value has side effects, such as
//! opening a handle that must later be released: a map that lets two threads
//! build the same value and throws one away leaks the discarded copy.
//!
//! # How it works
//!
//! Each key maps to an `Arc<`[`Slot`]`>`. A slot starts out holding its
//! producer; the first thread to force it takes the slot's lock and runs the
//! producer while the others park on the slot. Installing slots is an atomic
//! insert-if-absent on a sharded `DashMap`, and no map lock is held while a
//! producer runs, so waiting on one key never stalls other keys.
//!
//! Failures are cached: a slot whose producer returned `Err` keeps returning
//! that error. Remove or replace the key to try again. A producer that panics
//! poisons its slot, and every later read of that slot panics; `try_remove`
//! detaches a poisoned slot without panicking.
//!
//! # Features
//!
//! - `async-tokio`: async readers (`get_or_add_async`, `try_get_async`,
//!   `Slot::force_async`) that yield while another task produces the value.
//! - `async-tokio-mt` (default): additionally falls back to `block_in_place`
//!   after yielding for a while, when running on a multi-threaded runtime.
//!
//! # Examples
//!
//! ## Single-flight construction
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::thread;
//!
//! use lazy_map::LazyMap;
//!
//! static OPENED: AtomicUsize = AtomicUsize::new(0);
//!
//! let handles: Arc<LazyMap<String, Arc<String>, String>> = Arc::new(LazyMap::new());
//! let threads: Vec<_> = (0..8)
//!    .map(|_| {
//!       let handles = Arc::clone(&handles);
//!       thread::spawn(move || {
//!          handles.get_or_add("db".to_string(), |name| {
//!             OPENED.fetch_add(1, Ordering::SeqCst);
//!             Ok(Arc::new(format!("handle to {name}")))
//!          })
//!       })
//!    })
//!    .collect();
//!
//! for thread in threads {
//!    assert_eq!(thread.join().unwrap().unwrap().as_str(), "handle to db");
//! }
//! assert_eq!(OPENED.load(Ordering::SeqCst), 1);
//! ```
//!
//! ## Cached failures
//!
//! ```rust
//! use lazy_map::LazyMap;
//!
//! let map: LazyMap<u32, u32, &str> = LazyMap::new();
//! assert_eq!(map.get_or_add(1, |_| Err("offline")), Err("offline"));
//! // The failure is replayed, the new factory is not called.
//! assert_eq!(map.get_or_add(1, |_| Ok(7)), Err("offline"));
//!
//! map.try_remove(&1);
//! assert_eq!(map.get_or_add(1, |_| Ok(7)), Ok(7));
//! ```

/// Error types.
mod error;

/// Concurrent lazy map.
mod map;

/// Typed service registry.
mod registry;

/// Deferred single-execution slots.
mod slot;

/// Internal synchronization state management.
mod state;

pub use error::{RegistryError, RegistryResult, Timeout};
pub use map::{Entries, Keys, LazyMap};
pub use registry::{ServiceRegistry, ServiceResolver};
pub use slot::Slot;
