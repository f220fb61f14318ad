use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, Semaphore};
use tracing::trace;

use crate::relay::RelayLink;

/// Fired whenever a relay link enters or leaves the pool, so the admin layer
/// can feed a live pool-size readout. `pool_size` is the size *after* the
/// event is applied.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    NewReplier { pool_size: usize },
    PopReplier { pool_size: usize },
}

/// FIFO queue of authenticated, idle relay links.
///
/// The `Semaphore` permit count always tracks the queue length: `put` adds a
/// permit after pushing, `get` forgets one permit before popping. This gives
/// waiting `get()` callers fair FIFO wakeup without a busy-poll loop.
pub struct RelayPool {
    queue: Mutex<VecDeque<Arc<RelayLink>>>,
    permits: Semaphore,
    events: broadcast::Sender<PoolEvent>,
}

impl RelayPool {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(128);
        Arc::new(RelayPool {
            queue: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(0),
            events,
        })
    }

    /// Append `relay`. A relay must not already be in the pool.
    pub fn put(&self, relay: Arc<RelayLink>) {
        let size = {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(relay);
            queue.len()
        };
        self.permits.add_permits(1);
        trace!(pool_size = size, "relay pushed into pool");
        let _ = self.events.send(PoolEvent::NewReplier { pool_size: size });
    }

    /// Await until a relay is available, then pop and return the head.
    pub async fn get(&self) -> Arc<RelayLink> {
        let permit = self
            .permits
            .acquire()
            .await
            .expect("pool semaphore is never closed");
        permit.forget();
        let (relay, size) = {
            let mut queue = self.queue.lock().unwrap();
            let relay = queue
                .pop_front()
                .expect("a permit was issued, so the queue must be non-empty");
            (relay, queue.len())
        };
        trace!(pool_size = size, "relay pulled from pool");
        let _ = self.events.send(PoolEvent::PopReplier { pool_size: size });
        relay
    }

    /// Best-effort removal from the middle of the queue. Silent no-op if
    /// `relay` is not currently queued (already pulled, or never enqueued).
    pub fn remove(&self, relay: &Arc<RelayLink>) -> bool {
        let size = {
            let mut queue = self.queue.lock().unwrap();
            let Some(pos) = queue.iter().position(|r| Arc::ptr_eq(r, relay)) else {
                return false;
            };
            queue.remove(pos);
            queue.len()
        };
        // Consume the permit that corresponded to this entry.
        if let Ok(permit) = self.permits.try_acquire() {
            permit.forget();
        }
        let _ = self.events.send(PoolEvent::PopReplier { pool_size: size });
        true
    }

    pub fn size(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Empty the whole pool at once — used on a manager swap/loss, where
    /// every currently idle relay belongs to an epoch that no longer exists.
    /// Returns the drained links so the caller can close their transports.
    pub fn drain(&self) -> Vec<Arc<RelayLink>> {
        let drained = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect::<Vec<_>>()
        };
        for _ in 0..drained.len() {
            if let Ok(permit) = self.permits.try_acquire() {
                permit.forget();
            }
        }
        if !drained.is_empty() {
            let _ = self.events.send(PoolEvent::PopReplier { pool_size: 0 });
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::test_support::dummy_relay_link;

    #[tokio::test]
    async fn put_then_get_is_fifo() {
        let pool = RelayPool::new();
        let a = dummy_relay_link(1);
        let b = dummy_relay_link(2);
        pool.put(a.clone());
        pool.put(b.clone());

        assert!(Arc::ptr_eq(&pool.get().await, &a));
        assert!(Arc::ptr_eq(&pool.get().await, &b));
    }

    #[tokio::test]
    async fn get_blocks_until_a_put_arrives() {
        let pool = RelayPool::new();
        let pool2 = pool.clone();
        let handle = tokio::spawn(async move { pool2.get().await });

        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        let relay = dummy_relay_link(1);
        pool.put(relay.clone());

        let got = handle.await.unwrap();
        assert!(Arc::ptr_eq(&got, &relay));
    }

    #[tokio::test]
    async fn remove_is_silent_if_absent() {
        let pool = RelayPool::new();
        let relay = dummy_relay_link(1);
        assert!(!pool.remove(&relay));
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn remove_from_the_middle_does_not_disturb_fifo_order() {
        let pool = RelayPool::new();
        let a = dummy_relay_link(1);
        let b = dummy_relay_link(2);
        let c = dummy_relay_link(3);
        pool.put(a.clone());
        pool.put(b.clone());
        pool.put(c.clone());

        assert!(pool.remove(&b));
        assert_eq!(pool.size(), 2);

        assert!(Arc::ptr_eq(&pool.get().await, &a));
        assert!(Arc::ptr_eq(&pool.get().await, &c));
    }

    #[tokio::test]
    async fn drain_empties_the_queue_and_forgets_permits() {
        let pool = RelayPool::new();
        pool.put(dummy_relay_link(1));
        pool.put(dummy_relay_link(2));

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.size(), 0);

        // A subsequent get() should block rather than instantly return a
        // phantom relay from a leftover permit.
        let pool2 = pool.clone();
        let handle = tokio::spawn(async move { pool2.get().await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
