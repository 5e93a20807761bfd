// twsengine/src/registry.rs
// Correlation id -> observer routing, plus the fallback observer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::{Mutex, ReentrantMutex};

use crate::base::EngineError;
use crate::observer::Observer;
use crate::protocol_decoder::{Reply, Routing};

/// One registered observer. Delivery happens under `delivery`; removal takes
/// the same lock before clearing `active`, so once removal returns the
/// observer is never called again. The lock is reentrant so an observer may
/// unsubscribe itself from inside `observe`.
struct Entry {
  observer: Arc<dyn Observer>,
  delivery: ReentrantMutex<()>,
  active: AtomicBool,
}

impl Entry {
  fn new(observer: Arc<dyn Observer>) -> Arc<Self> {
    Arc::new(Entry { observer, delivery: ReentrantMutex::new(()), active: AtomicBool::new(true) })
  }

  fn deliver(&self, reply: Reply) -> bool {
    let _guard = self.delivery.lock();
    if !self.active.load(Ordering::Acquire) {
      return false;
    }
    self.observer.observe(reply);
    true
  }

  fn deactivate(&self) {
    let _guard = self.delivery.lock();
    self.active.store(false, Ordering::Release);
  }
}

/// Routes decoded replies to the observer registered for their request id.
///
/// The map lock is only held for lookups and mutations, never while an
/// observer runs.
#[derive(Default)]
pub struct SubscriptionRegistry {
  entries: Mutex<HashMap<i32, Arc<Entry>>>,
  fallback: Mutex<Option<Arc<Entry>>>,
}

impl SubscriptionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self, observer: Arc<dyn Observer>, id: i32) -> Result<(), EngineError> {
    let mut entries = self.entries.lock();
    if entries.contains_key(&id) {
      return Err(EngineError::AlreadySubscribed(id));
    }
    entries.insert(id, Entry::new(observer));
    debug!("Subscribed observer for request ID {}", id);
    Ok(())
  }

  /// Remove the observer for `id`. No-op if none is registered. A delivery
  /// already running on another thread finishes before this returns.
  pub fn unsubscribe(&self, id: i32) {
    let removed = self.entries.lock().remove(&id);
    if let Some(entry) = removed {
      entry.deactivate();
      debug!("Unsubscribed request ID {}", id);
    }
  }

  pub fn is_subscribed(&self, id: i32) -> bool {
    self.entries.lock().contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn set_fallback(&self, observer: Arc<dyn Observer>) {
    let previous = self.fallback.lock().replace(Entry::new(observer));
    if let Some(entry) = previous {
      entry.deactivate();
    }
  }

  pub fn clear_fallback(&self) {
    let previous = self.fallback.lock().take();
    if let Some(entry) = previous {
      entry.deactivate();
    }
  }

  /// Drop every subscription and the fallback.
  pub fn clear(&self) {
    let drained: Vec<(i32, Arc<Entry>)> = self.entries.lock().drain().collect();
    let count = drained.len();
    for (_, entry) in drained {
      entry.deactivate();
    }
    self.clear_fallback();
    if count > 0 {
      debug!("Cleared {} subscriptions", count);
    }
  }

  /// Deliver one reply according to its routing. Returns true if an observer received it.
  pub fn dispatch(&self, reply: Reply) -> bool {
    match reply.routing() {
      Routing::Correlated(id) => match self.lookup(id) {
        Some(entry) => entry.deliver(reply),
        None => {
          trace!("Dropping reply for unsubscribed request ID {}: {}", id, reply);
          false
        }
      },
      Routing::CorrelatedOrFallback(id) => match self.lookup(id) {
        Some(entry) => entry.deliver(reply),
        None => self.deliver_fallback(reply),
      },
      Routing::Uncorrelated => self.deliver_fallback(reply),
    }
  }

  /// Tell the fallback observer that the connection is gone.
  pub fn notify_connection_closed(&self) {
    if let Some(entry) = self.fallback.lock().clone() {
      let _guard = entry.delivery.lock();
      if entry.active.load(Ordering::Acquire) {
        entry.observer.connection_closed();
      }
    }
  }

  fn lookup(&self, id: i32) -> Option<Arc<Entry>> {
    self.entries.lock().get(&id).cloned()
  }

  fn deliver_fallback(&self, reply: Reply) -> bool {
    let fallback = self.fallback.lock().clone();
    match fallback {
      Some(entry) => entry.deliver(reply),
      None => {
        if let Reply::DecodeFailure { .. } = reply {
          warn!("No fallback observer for {}", reply);
        } else {
          trace!("No fallback observer; dropping {}", reply);
        }
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::observer::ChannelObserver;
  use std::sync::atomic::AtomicUsize;
  use std::thread;
  use std::time::Duration;

  fn end(id: i32) -> Reply {
    Reply::ContractDataEnd { req_id: id }
  }

  #[test]
  fn test_exact_delivery() {
    let registry = SubscriptionRegistry::new();
    let (a, rx_a) = ChannelObserver::unbounded();
    let (b, rx_b) = ChannelObserver::unbounded();
    registry.subscribe(Arc::new(a), 1).unwrap();
    registry.subscribe(Arc::new(b), 2).unwrap();

    assert!(registry.dispatch(end(1)));
    assert!(registry.dispatch(end(2)));
    assert!(registry.dispatch(end(1)));

    assert_eq!(rx_a.try_iter().collect::<Vec<_>>(), vec![end(1), end(1)]);
    assert_eq!(rx_b.try_iter().collect::<Vec<_>>(), vec![end(2)]);
  }

  #[test]
  fn test_unknown_id_dropped() {
    let registry = SubscriptionRegistry::new();
    let (fallback, rx) = ChannelObserver::unbounded();
    registry.set_fallback(Arc::new(fallback));
    assert!(!registry.dispatch(end(99)));
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn test_duplicate_subscribe_rejected() {
    let registry = SubscriptionRegistry::new();
    let (a, rx_a) = ChannelObserver::unbounded();
    let (b, _rx_b) = ChannelObserver::unbounded();
    registry.subscribe(Arc::new(a), 5).unwrap();
    assert_eq!(registry.subscribe(Arc::new(b), 5), Err(EngineError::AlreadySubscribed(5)));
    registry.dispatch(end(5));
    assert_eq!(rx_a.try_recv().unwrap(), end(5));
  }

  #[test]
  fn test_unsubscribe_stops_delivery() {
    let registry = SubscriptionRegistry::new();
    let (a, rx) = ChannelObserver::unbounded();
    registry.subscribe(Arc::new(a), 3).unwrap();
    registry.unsubscribe(3);
    registry.unsubscribe(3); // absent: no-op
    assert!(!registry.dispatch(end(3)));
    assert!(rx.try_recv().is_err());
    assert!(registry.is_empty());
  }

  #[test]
  fn test_fallback_routing() {
    let registry = SubscriptionRegistry::new();
    let (fallback, rx_fb) = ChannelObserver::unbounded();
    let (sub, rx_sub) = ChannelObserver::unbounded();
    registry.set_fallback(Arc::new(fallback));
    registry.subscribe(Arc::new(sub), 8).unwrap();

    let next_id = Reply::NextValidId { order_id: 100 };
    let general = Reply::Error { id: -1, code: 2104, message: "ok".into(), advanced_order_reject_json: None };
    let scoped = Reply::Error { id: 8, code: 200, message: "no sec".into(), advanced_order_reject_json: None };
    let orphan = Reply::Error { id: 9, code: 300, message: "gone".into(), advanced_order_reject_json: None };
    let failure = Reply::DecodeFailure { msg_type: 999, error: EngineError::UnknownMessageType(999) };

    for r in [next_id.clone(), general.clone(), scoped.clone(), orphan.clone(), failure.clone()] {
      assert!(registry.dispatch(r));
    }
    assert_eq!(rx_fb.try_iter().collect::<Vec<_>>(), vec![next_id, general, orphan, failure]);
    assert_eq!(rx_sub.try_iter().collect::<Vec<_>>(), vec![scoped]);
  }

  #[test]
  fn test_observer_can_unsubscribe_itself() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let count = Arc::new(AtomicUsize::new(0));
    let (reg, c) = (registry.clone(), count.clone());
    let obs = move |reply: Reply| {
      c.fetch_add(1, Ordering::SeqCst);
      if let Some(id) = reply.correlation_id() {
        reg.unsubscribe(id);
      }
    };
    registry.subscribe(Arc::new(obs), 4).unwrap();
    assert!(registry.dispatch(end(4)));
    assert!(!registry.dispatch(end(4)));
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_no_delivery_after_unsubscribe_returns() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let unsubscribed = Arc::new(AtomicBool::new(false));
    let late = Arc::new(AtomicUsize::new(0));
    let (flag, late_c) = (unsubscribed.clone(), late.clone());
    let obs = move |_reply: Reply| {
      if flag.load(Ordering::SeqCst) {
        late_c.fetch_add(1, Ordering::SeqCst);
      }
      thread::sleep(Duration::from_micros(50));
    };
    registry.subscribe(Arc::new(obs), 6).unwrap();

    let reg = registry.clone();
    let dispatcher = thread::spawn(move || {
      for _ in 0..2000 {
        reg.dispatch(end(6));
      }
    });
    thread::sleep(Duration::from_millis(5));
    registry.unsubscribe(6);
    unsubscribed.store(true, Ordering::SeqCst);
    dispatcher.join().unwrap();
    assert_eq!(late.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_clear() {
    let registry = SubscriptionRegistry::new();
    let (a, rx) = ChannelObserver::unbounded();
    let (fallback, rx_fb) = ChannelObserver::unbounded();
    registry.subscribe(Arc::new(a), 1).unwrap();
    registry.set_fallback(Arc::new(fallback));
    registry.clear();
    assert!(!registry.dispatch(end(1)));
    assert!(!registry.dispatch(Reply::NextValidId { order_id: 1 }));
    assert!(rx.try_recv().is_err());
    assert!(rx_fb.try_recv().is_err());
  }
}
