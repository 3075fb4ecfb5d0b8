//! Typed service registry on top of [`LazyMap`].
//!
//! A [`ServiceRegistry`] keeps one instance per concrete service type, keyed by
//! the `TypeId` of the value (or of the factory's return type). Factories run
//! lazily and at most once, with the same guarantees as the map. Picking which
//! registered implementation serves a request is left to a
//! [`ServiceResolver`].

use core::any::{type_name, Any, TypeId};
use core::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::map::LazyMap;

/// A registered service, type-erased.
#[derive(Clone)]
struct Registration {
   type_name: &'static str,
   instance: Arc<dyn Any + Send + Sync>,
}

impl Registration {
   fn new<T: Send + Sync + 'static>(instance: Arc<T>) -> Self {
      Self {
         type_name: type_name::<T>(),
         instance,
      }
   }

   /// Checked downcast back to the concrete service type.
   fn downcast<T: Send + Sync + 'static>(self) -> RegistryResult<Arc<T>> {
      let found = self.type_name;
      self
         .instance
         .downcast::<T>()
         .map_err(|_| RegistryError::TypeMismatch {
            expected: type_name::<T>(),
            found,
         })
   }
}

/// Stores one instance per concrete service type.
///
/// # Examples
///
/// ```rust
/// use lazy_map::{RegistryError, ServiceRegistry};
///
/// struct Clock {
///    offset: i64,
/// }
///
/// let registry = ServiceRegistry::new();
/// registry.set_service_with(|| Clock { offset: 3 });
///
/// assert_eq!(registry.get_service::<Clock>().unwrap().offset, 3);
/// assert!(matches!(
///    registry.get_service::<String>(),
///    Err(RegistryError::NotFound(_))
/// ));
/// ```
#[derive(Default)]
pub struct ServiceRegistry {
   services: LazyMap<TypeId, Registration>,
}

impl ServiceRegistry {
   /// Creates an empty registry.
   #[must_use]
   pub fn new() -> Self {
      Self::default()
   }

   /// Registers `service` as the instance of `T`, replacing any previous one.
   pub fn set_service<T: Send + Sync + 'static>(&self, service: T) {
      self.set_service_arc(Arc::new(service));
   }

   /// Registers an already shared instance of `T`.
   pub fn set_service_arc<T: Send + Sync + 'static>(&self, service: Arc<T>) {
      self
         .services
         .set(TypeId::of::<T>(), Registration::new(service));
      debug!(service = type_name::<T>(), "registered service instance");
   }

   /// Registers a factory for `T`. It runs on first retrieval, once.
   pub fn set_service_with<T, F>(&self, factory: F)
   where
      T: Send + Sync + 'static,
      F: FnOnce() -> T + Send + 'static,
   {
      self.services.set_with(TypeId::of::<T>(), move |_| {
         debug!(service = type_name::<T>(), "constructing service");
         Ok(Registration::new(Arc::new(factory())))
      });
      debug!(service = type_name::<T>(), "registered service factory");
   }

   fn lookup<T: Send + Sync + 'static>(&self) -> Option<Registration> {
      self
         .services
         .try_get(&TypeId::of::<T>())
         .map(|result| match result {
            Ok(registration) => registration,
            Err(never) => match never {},
         })
   }

   /// Returns the instance of `T`, or `None` if none was registered.
   pub fn try_get_service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
      self.lookup::<T>()?.downcast().ok()
   }

   /// Returns the instance of `T`.
   ///
   /// Fails with [`RegistryError::NotFound`] if `T` was never registered.
   pub fn get_service<T: Send + Sync + 'static>(&self) -> RegistryResult<Arc<T>> {
      self
         .lookup::<T>()
         .ok_or(RegistryError::NotFound(type_name::<T>()))?
         .downcast()
   }

   /// Checks whether `T` is registered, without constructing it.
   pub fn contains_service<T: Send + Sync + 'static>(&self) -> bool {
      self.services.contains_key(&TypeId::of::<T>())
   }

   /// Unregisters `T`, returning its instance.
   ///
   /// Returns `None` if `T` was not registered or its factory panicked; the
   /// registration is dropped either way.
   pub fn remove_service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
      let registration = match self.services.try_remove(&TypeId::of::<T>())? {
         Ok(registration) => registration,
         Err(never) => match never {},
      };
      debug!(service = type_name::<T>(), "removed service");
      registration.downcast().ok()
   }

   /// Number of registered service types.
   pub fn len(&self) -> usize {
      self.services.len()
   }

   pub fn is_empty(&self) -> bool {
      self.services.is_empty()
   }
}

impl fmt::Debug for ServiceRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ServiceRegistry")
         .field("services", &self.services.len())
         .finish()
   }
}

/// Picks a registered implementation for a request.
///
/// `Service` is the interface every candidate implements (usually a trait
/// object) and `Params` is whatever the decision is made on. Implementations
/// typically inspect the params and call
/// [`ServiceRegistry::try_get_service`] for the matching concrete type.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use lazy_map::{ServiceRegistry, ServiceResolver};
///
/// trait Greeter: Send + Sync {
///    fn greet(&self) -> String;
/// }
///
/// struct English;
/// impl Greeter for English {
///    fn greet(&self) -> String {
///       "hello".into()
///    }
/// }
///
/// struct Greeters {
///    registry: ServiceRegistry,
/// }
///
/// #[async_trait]
/// impl ServiceResolver for Greeters {
///    type Service = dyn Greeter;
///    type Params = String;
///
///    fn registry(&self) -> &ServiceRegistry {
///       &self.registry
///    }
///
///    async fn retrieve_service(&self, language: &String) -> Option<Arc<dyn Greeter>> {
///       match language.as_str() {
///          "en" => self
///             .registry
///             .try_get_service::<English>()
///             .map(|greeter| greeter as Arc<dyn Greeter>),
///          _ => None,
///       }
///    }
/// }
/// ```
#[async_trait]
pub trait ServiceResolver: Send + Sync {
   /// Interface shared by the candidate implementations.
   type Service: ?Sized + Send + Sync;
   /// Input to the selection.
   type Params: Send + Sync;

   /// Registry the candidates live in.
   fn registry(&self) -> &ServiceRegistry;

   /// Selects the implementation serving `params`, or `None`.
   async fn retrieve_service(&self, params: &Self::Params) -> Option<Arc<Self::Service>>;
}
