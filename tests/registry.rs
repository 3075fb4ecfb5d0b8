use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use async_trait::async_trait;
use lazy_map::{RegistryError, ServiceRegistry, ServiceResolver};

// ===== Preview generators =====

trait PreviewGenerator: Send + Sync {
   fn generate(&self, filename: &str) -> String;
}

#[derive(Debug, Default)]
struct VideoPreviewGenerator;

impl PreviewGenerator for VideoPreviewGenerator {
   fn generate(&self, filename: &str) -> String {
      format!("video thumbnail of {filename}")
   }
}

#[derive(Debug, Default)]
struct DocumentPreviewGenerator {
   pages: usize,
}

impl PreviewGenerator for DocumentPreviewGenerator {
   fn generate(&self, filename: &str) -> String {
      format!("first {} pages of {filename}", self.pages)
   }
}

struct PreviewParams {
   filename: String,
}

struct PreviewGenerators {
   registry: ServiceRegistry,
}

#[async_trait]
impl ServiceResolver for PreviewGenerators {
   type Service = dyn PreviewGenerator;
   type Params = PreviewParams;

   fn registry(&self) -> &ServiceRegistry {
      &self.registry
   }

   async fn retrieve_service(&self, params: &PreviewParams) -> Option<Arc<dyn PreviewGenerator>> {
      let registry = self.registry();
      match params.filename.rsplit_once('.').map(|(_, ext)| ext) {
         Some("video") => registry
            .try_get_service::<VideoPreviewGenerator>()
            .map(|g| g as Arc<dyn PreviewGenerator>),
         Some("doc") => registry
            .try_get_service::<DocumentPreviewGenerator>()
            .map(|g| g as Arc<dyn PreviewGenerator>),
         _ => None,
      }
   }
}

fn preview_generators() -> PreviewGenerators {
   let registry = ServiceRegistry::new();
   registry.set_service(VideoPreviewGenerator);
   registry.set_service_with(|| DocumentPreviewGenerator { pages: 3 });
   PreviewGenerators { registry }
}

// ===== Tests =====

#[tokio::test]
async fn test_retrieve_service_by_filename() {
   let generators = preview_generators();

   let video = generators
      .retrieve_service(&PreviewParams {
         filename: "file.video".into(),
      })
      .await
      .expect("video generator");
   assert_eq!(video.generate("file.video"), "video thumbnail of file.video");
   let registered = generators
      .registry()
      .get_service::<VideoPreviewGenerator>()
      .unwrap();
   // Same instance as the registered one, not a copy
   assert!(std::ptr::eq(
      Arc::as_ptr(&video) as *const u8,
      Arc::as_ptr(&registered) as *const u8
   ));

   let document = generators
      .retrieve_service(&PreviewParams {
         filename: "file.doc".into(),
      })
      .await
      .expect("document generator");
   assert_eq!(document.generate("file.doc"), "first 3 pages of file.doc");

   let unknown = generators
      .retrieve_service(&PreviewParams {
         filename: "file.unknown".into(),
      })
      .await;
   assert!(unknown.is_none());
}

#[test]
fn test_get_service_not_found() {
   let registry = ServiceRegistry::new();
   match registry.get_service::<VideoPreviewGenerator>() {
      Err(RegistryError::NotFound(name)) => assert!(name.ends_with("VideoPreviewGenerator")),
      other => panic!("expected NotFound, got {other:?}"),
   }
   assert!(registry.try_get_service::<VideoPreviewGenerator>().is_none());
   assert!(!registry.contains_service::<VideoPreviewGenerator>());
}

#[test]
fn test_not_found_display() {
   let err = RegistryError::NotFound("MyService");
   assert_eq!(err.to_string(), "service not found: MyService");
   let err = RegistryError::TypeMismatch {
      expected: "A",
      found: "B",
   };
   assert_eq!(err.to_string(), "type mismatch: expected A, found B");
}

#[test]
fn test_set_and_get_service() {
   let registry = ServiceRegistry::new();
   assert!(registry.is_empty());

   registry.set_service(DocumentPreviewGenerator { pages: 1 });
   assert_eq!(registry.len(), 1);
   assert!(registry.contains_service::<DocumentPreviewGenerator>());
   assert_eq!(registry.get_service::<DocumentPreviewGenerator>().unwrap().pages, 1);

   // Registering the same concrete type again replaces the instance
   registry.set_service(DocumentPreviewGenerator { pages: 9 });
   assert_eq!(registry.len(), 1);
   assert_eq!(registry.get_service::<DocumentPreviewGenerator>().unwrap().pages, 9);
}

#[test]
fn test_set_service_arc_shares_instance() {
   let registry = ServiceRegistry::new();
   let shared = Arc::new(DocumentPreviewGenerator { pages: 2 });
   registry.set_service_arc(Arc::clone(&shared));
   let resolved = registry.get_service::<DocumentPreviewGenerator>().unwrap();
   assert!(Arc::ptr_eq(&shared, &resolved));
}

#[test]
fn test_factory_keyed_by_return_type() {
   let registry = ServiceRegistry::new();
   // Two differently shaped factories producing the same concrete type share one entry
   registry.set_service_with(|| DocumentPreviewGenerator { pages: 4 });
   registry.set_service_with(DocumentPreviewGenerator::default);
   assert_eq!(registry.len(), 1);
   assert_eq!(registry.get_service::<DocumentPreviewGenerator>().unwrap().pages, 0);
}

#[test]
fn test_factory_runs_lazily_and_once() {
   let registry = Arc::new(ServiceRegistry::new());
   let constructed = Arc::new(AtomicUsize::new(0));
   {
      let constructed = Arc::clone(&constructed);
      registry.set_service_with(move || {
         constructed.fetch_add(1, Ordering::SeqCst);
         VideoPreviewGenerator
      });
   }
   assert!(registry.contains_service::<VideoPreviewGenerator>());
   assert_eq!(constructed.load(Ordering::SeqCst), 0);

   let barrier = Arc::new(Barrier::new(8));
   let threads: Vec<_> = (0..8)
      .map(|_| {
         let registry = Arc::clone(&registry);
         let barrier = Arc::clone(&barrier);
         thread::spawn(move || {
            barrier.wait();
            registry.get_service::<VideoPreviewGenerator>().unwrap()
         })
      })
      .collect();

   let instances: Vec<_> = threads.into_iter().map(|h| h.join().unwrap()).collect();
   assert_eq!(constructed.load(Ordering::SeqCst), 1);
   for instance in &instances {
      assert!(Arc::ptr_eq(instance, &instances[0]));
   }
}

#[test]
fn test_remove_service() {
   let registry = ServiceRegistry::new();
   registry.set_service(DocumentPreviewGenerator { pages: 5 });
   let removed = registry.remove_service::<DocumentPreviewGenerator>().unwrap();
   assert_eq!(removed.pages, 5);
   assert!(registry.remove_service::<DocumentPreviewGenerator>().is_none());
   assert!(matches!(
      registry.get_service::<DocumentPreviewGenerator>(),
      Err(RegistryError::NotFound(_))
   ));
}

#[test]
fn test_remove_service_after_factory_panic() {
   let registry = ServiceRegistry::new();
   registry.set_service_with(|| -> VideoPreviewGenerator { panic!("constructor failed") });
   let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      registry.get_service::<VideoPreviewGenerator>()
   }));
   assert!(result.is_err());

   // The broken registration can be dropped and replaced
   assert!(registry.remove_service::<VideoPreviewGenerator>().is_none());
   assert!(!registry.contains_service::<VideoPreviewGenerator>());
   registry.set_service(VideoPreviewGenerator);
   assert!(registry.get_service::<VideoPreviewGenerator>().is_ok());
}
