use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use lazy_map::{Slot, Timeout};

#[test]
fn test_new_is_not_done() {
   let slot: Slot<i32, ()> = Slot::new(|| Ok(1));
   assert!(!slot.is_done());
   assert!(!slot.is_poisoned());
   assert_eq!(slot.peek(), None);
}

#[test]
fn test_with_value_is_done() {
   let slot: Slot<i32> = Slot::with_value(42);
   assert!(slot.is_done());
   assert_eq!(slot.peek(), Some(Ok(&42)));
   assert_eq!(slot.force(), Ok(42));

   let slot: Slot<i32> = 7.into();
   assert_eq!(slot.force(), Ok(7));
}

#[test]
fn test_with_result_error() {
   let slot: Slot<i32, &str> = Slot::with_result(Err("nope"));
   assert!(slot.is_done());
   assert_eq!(slot.peek(), Some(Err(&"nope")));
   assert_eq!(slot.force(), Err("nope"));
}

#[test]
fn test_force_runs_producer_once() {
   let counter = Arc::new(AtomicUsize::new(0));
   let slot: Slot<String, ()> = {
      let counter = Arc::clone(&counter);
      Slot::new(move || {
         counter.fetch_add(1, Ordering::SeqCst);
         Ok("value".to_string())
      })
   };

   assert_eq!(slot.force(), Ok("value".to_string()));
   assert_eq!(slot.force(), Ok("value".to_string()));
   assert_eq!(slot.peek(), Some(Ok(&"value".to_string())));
   assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failure_is_replayed() {
   let counter = Arc::new(AtomicUsize::new(0));
   let slot: Slot<i32, String> = {
      let counter = Arc::clone(&counter);
      Slot::new(move || {
         counter.fetch_add(1, Ordering::SeqCst);
         Err("broken".to_string())
      })
   };

   assert_eq!(slot.force(), Err("broken".to_string()));
   assert_eq!(slot.force(), Err("broken".to_string()));
   assert!(slot.is_done());
   assert!(!slot.is_poisoned());
   assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_multi_thread_force() {
   let counter = Arc::new(AtomicUsize::new(0));
   let slot: Arc<Slot<usize, ()>> = {
      let counter = Arc::clone(&counter);
      Arc::new(Slot::new(move || {
         counter.fetch_add(1, Ordering::SeqCst);
         thread::sleep(Duration::from_millis(20));
         Ok(42)
      }))
   };

   let threads: Vec<_> = (0..10)
      .map(|_| {
         let slot = Arc::clone(&slot);
         thread::spawn(move || slot.force())
      })
      .collect();

   for handle in threads {
      assert_eq!(handle.join().unwrap(), Ok(42));
   }
   assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_force_timeout() {
   let (started_tx, started_rx) = mpsc::channel();
   let (release_tx, release_rx) = mpsc::channel::<()>();
   let slot: Arc<Slot<u8, ()>> = Arc::new(Slot::new(move || {
      started_tx.send(()).unwrap();
      release_rx.recv().unwrap();
      Ok(9)
   }));

   let runner = {
      let slot = Arc::clone(&slot);
      thread::spawn(move || slot.force())
   };

   started_rx.recv().unwrap();
   assert_eq!(slot.force_timeout(Duration::from_millis(20)), Err(Timeout));
   assert!(!slot.is_done());

   release_tx.send(()).unwrap();
   assert_eq!(slot.force_timeout(Duration::from_secs(5)), Ok(Ok(9)));
   assert_eq!(runner.join().unwrap(), Ok(9));
}

#[test]
fn test_force_timeout_runs_unstarted_producer() {
   let slot: Slot<u8, ()> = Slot::new(|| Ok(3));
   assert_eq!(slot.force_timeout(Duration::ZERO), Ok(Ok(3)));

   // A deadline that cannot be represented waits without a bound
   let unbounded: Slot<u8, ()> = Slot::new(|| Ok(4));
   assert_eq!(unbounded.force_timeout(Duration::MAX), Ok(Ok(4)));
}

#[test]
fn test_try_force_reports_poisoned_slot() {
   let slot: Slot<u8, ()> = Slot::new(|| panic!("producer exploded"));
   let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| slot.force()));
   assert!(result.is_err());
   assert!(slot.is_poisoned());

   assert_eq!(slot.try_force(), None);
   let again = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| slot.force()));
   assert!(again.is_err());

   let healthy: Slot<u8, ()> = Slot::new(|| Ok(6));
   assert_eq!(healthy.try_force(), Some(Ok(6)));
}

#[test]
fn test_drop_unforced_producer() {
   let tracker = Arc::new(());
   let slot: Slot<(), ()> = {
      let tracker = Arc::clone(&tracker);
      Slot::new(move || {
         drop(tracker);
         Ok(())
      })
   };
   assert_eq!(Arc::strong_count(&tracker), 2);
   drop(slot);
   assert_eq!(Arc::strong_count(&tracker), 1);
}

#[test]
fn test_drop_value_on_slot_drop() {
   let tracker = Arc::new(());
   let slot: Slot<Arc<()>, ()> = Slot::with_value(Arc::clone(&tracker));
   let value = slot.force().unwrap();
   assert_eq!(Arc::strong_count(&tracker), 3);
   drop(value);
   drop(slot);
   assert_eq!(Arc::strong_count(&tracker), 1);
}

#[test]
fn test_debug() {
   let pending: Slot<i32, ()> = Slot::new(|| Ok(1));
   assert_eq!(format!("{:?}", pending), "Slot(<pending>)");
   pending.force().unwrap();
   assert_eq!(format!("{:?}", pending), "Slot(Ok(1))");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_force_async() {
   let counter = Arc::new(AtomicUsize::new(0));
   let slot: Arc<Slot<u32, ()>> = {
      let counter = Arc::clone(&counter);
      Arc::new(Slot::new(move || {
         counter.fetch_add(1, Ordering::SeqCst);
         Ok(5)
      }))
   };

   let tasks: Vec<_> = (0..4)
      .map(|_| {
         let slot = Arc::clone(&slot);
         tokio::spawn(async move { slot.force_async().await })
      })
      .collect();
   for task in tasks {
      assert_eq!(task.await.unwrap(), Ok(5));
   }
   assert_eq!(counter.load(Ordering::SeqCst), 1);
}
