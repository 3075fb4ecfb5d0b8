//! Error types.
//!
//! The map itself has no error type: it hands back whatever error the
//! producer returned. Only the registry and the bounded waits add their own.

use thiserror::Error;

/// Service registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
   /// No service of the requested type was registered.
   #[error("service not found: {0}")]
   NotFound(&'static str),
   /// The stored service failed the checked downcast to the requested type.
   #[error("type mismatch: expected {expected}, found {found}")]
   TypeMismatch {
      expected: &'static str,
      found: &'static str,
   },
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Returned by the bounded waits when the deadline passes while another thread
/// is still running the slot's producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out waiting for a slot producer")]
pub struct Timeout;
