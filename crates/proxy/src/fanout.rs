//! Shared callback registry for the RTP and event fanouts.
//!
//! A registry is an id-keyed set of delivery callbacks. Dispatch iterates
//! every callback inside one critical section and unregisters any that fail,
//! so a dead peer is pruned by its first failed delivery. Callbacks must not
//! block: anything that would block has to fail fast instead (the subscriber
//! is then dropped and can re-register).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{info, warn};

pub type CallbackFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type Callback<T> = Box<dyn Fn(T) -> CallbackFuture + Send + Sync>;

pub struct Registry<T> {
    label: &'static str,
    callbacks: Mutex<HashMap<u64, Callback<T>>>,
}

impl<T: Clone> Registry<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, id: u64, callback: Callback<T>) {
        info!(peer_id = id, fanout = self.label, "registering callback");
        self.callbacks.lock().await.insert(id, callback);
    }

    /// Delete-if-present. Teardown paths race (ICE close vs. channel read
    /// failure) and both call this, so a second call is a silent no-op.
    pub async fn unregister(&self, id: u64) {
        if self.callbacks.lock().await.remove(&id).is_some() {
            info!(peer_id = id, fanout = self.label, "unregistered callback");
        }
    }

    pub async fn len(&self) -> usize {
        self.callbacks.lock().await.len()
    }

    /// Deliver `item` to every subscriber, unregistering the ones whose
    /// callbacks fail. Failed ids are collected during iteration and removed
    /// before the lock is released.
    pub async fn dispatch(&self, item: T) {
        let mut callbacks = self.callbacks.lock().await;
        let mut failed = Vec::new();
        for (id, callback) in callbacks.iter() {
            if let Err(e) = callback(item.clone()).await {
                warn!(
                    peer_id = *id,
                    fanout = self.label,
                    "delivery failed, unregistering: {e}"
                );
                failed.push(*id);
            }
        }
        for id in &failed {
            callbacks.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn recorder(tx: mpsc::UnboundedSender<u32>) -> Callback<u32> {
        Box::new(move |item| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(item).expect("test channel open");
                Ok(())
            })
        })
    }

    fn failing() -> Callback<u32> {
        Box::new(|_| Box::pin(async { Err(anyhow::anyhow!("peer went away")) }))
    }

    #[tokio::test]
    async fn subscribers_see_items_in_dispatch_order() {
        let registry = Registry::new("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(1, recorder(tx)).await;

        registry.dispatch(10).await;
        registry.dispatch(20).await;
        registry.dispatch(30).await;

        assert_eq!(rx.recv().await, Some(10));
        assert_eq!(rx.recv().await, Some(20));
        assert_eq!(rx.recv().await, Some(30));
    }

    #[tokio::test]
    async fn failing_subscriber_is_pruned_others_survive() {
        let registry = Registry::new("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(1, failing()).await;
        registry.register(2, recorder(tx)).await;
        assert_eq!(registry.len().await, 2);

        registry.dispatch(42).await;

        assert_eq!(registry.len().await, 1, "failed subscriber removed");
        assert_eq!(rx.recv().await, Some(42), "healthy subscriber delivered");

        // Delivery keeps working for the survivor
        registry.dispatch(43).await;
        assert_eq!(rx.recv().await, Some(43));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = Registry::new("test");
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(7, recorder(tx)).await;

        registry.unregister(7).await;
        registry.unregister(7).await;
        registry.unregister(99).await;

        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn teardown_race_leaves_other_peer_intact() {
        // Two peers registered in two registries; peer 1 is torn down twice
        // (channel failure then ICE close) and peer 2 must be untouched.
        let rtp: Arc<Registry<u32>> = Arc::new(Registry::new("rtp"));
        let events: Arc<Registry<u32>> = Arc::new(Registry::new("events"));
        let (tx, _rx) = mpsc::unbounded_channel();
        rtp.register(1, recorder(tx.clone())).await;
        rtp.register(2, recorder(tx.clone())).await;
        events.register(1, recorder(tx.clone())).await;
        events.register(2, recorder(tx)).await;

        for _ in 0..2 {
            rtp.unregister(1).await;
            events.unregister(1).await;
        }

        assert_eq!(rtp.len().await, 1);
        assert_eq!(events.len().await, 1);
    }

    #[tokio::test]
    async fn dispatch_with_no_subscribers_is_a_no_op() {
        let registry: Registry<u32> = Registry::new("test");
        registry.dispatch(1).await;
        assert_eq!(registry.len().await, 0);
    }
}
