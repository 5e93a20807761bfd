// twsengine/src/request_id.rs
// Engine-scoped correlation id counter.

use std::sync::atomic::{AtomicI32, Ordering};

use log::debug;

/// Hands out strictly increasing request ids. Lock-free and safe to share.
#[derive(Debug)]
pub struct RequestIdAllocator {
  next_id: AtomicI32,
}

impl RequestIdAllocator {
  pub fn new(seed: i32) -> Self {
    RequestIdAllocator { next_id: AtomicI32::new(seed) }
  }

  /// Returns the next id. Never returns the same value twice.
  pub fn next(&self) -> i32 {
    self.next_id.fetch_add(1, Ordering::SeqCst)
  }

  /// Value the next call to `next` would return.
  pub fn peek(&self) -> i32 {
    self.next_id.load(Ordering::SeqCst)
  }

  /// Make sure future ids are at least `min`. Never moves the counter backwards.
  pub fn advance_to(&self, min: i32) {
    let prev = self.next_id.fetch_max(min, Ordering::SeqCst);
    if prev < min {
      debug!("Request ID counter advanced from {} to {}", prev, min);
    }
  }
}

impl Default for RequestIdAllocator {
  fn default() -> Self {
    Self::new(1)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn test_sequential() {
    let alloc = RequestIdAllocator::new(100);
    assert_eq!(alloc.next(), 100);
    assert_eq!(alloc.next(), 101);
    assert_eq!(alloc.peek(), 102);
  }

  #[test]
  fn test_advance_never_goes_back() {
    let alloc = RequestIdAllocator::new(10);
    alloc.advance_to(5);
    assert_eq!(alloc.next(), 10);
    alloc.advance_to(50);
    assert_eq!(alloc.next(), 50);
    assert_eq!(alloc.next(), 51);
  }

  #[test]
  fn test_concurrent_ids_distinct_and_increasing() {
    let alloc = Arc::new(RequestIdAllocator::new(1));
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let alloc = alloc.clone();
        thread::spawn(move || (0..1000).map(|_| alloc.next()).collect::<Vec<i32>>())
      })
      .collect();

    let mut all = HashSet::new();
    for h in handles {
      let ids = h.join().unwrap();
      assert!(ids.windows(2).all(|w| w[0] < w[1]));
      for id in ids {
        assert!(all.insert(id), "duplicate id {}", id);
      }
    }
    assert_eq!(all.len(), 8000);
    assert_eq!(alloc.peek(), 8001);
  }
}
