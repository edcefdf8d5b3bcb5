//! Event fan-out: bridges the bus's incoming event sink to per-peer data
//! channels, and gives the reverse direction one choke point for putting
//! peer-injected events onto the bus.

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tokio::sync::mpsc;
use tracing::warn;
use trestle_bus::EventBus;
use trestle_protocol::wire::Event;

use crate::fanout::{Callback, Registry};

pub type EventCallback = Callback<Bytes>;

pub struct EventFanout {
    bus: Arc<EventBus>,
    callbacks: Registry<Bytes>,
}

impl EventFanout {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            callbacks: Registry::new("events"),
        })
    }

    /// Spawn the dispatch loop draining the bus sink.
    pub fn start(self: &Arc<Self>, source: mpsc::Receiver<Event>) {
        let fanout = Arc::clone(self);
        tokio::spawn(async move { pump(&fanout.callbacks, source).await });
    }

    /// Put an event received from a peer onto the bus.
    ///
    /// Every connected peer can reach this; an authorization check would go
    /// here if peers ever stop being trusted.
    pub async fn send_event(&self, event: &Event) -> usize {
        self.bus.send_event(event).await
    }

    pub async fn register(&self, id: u64, callback: EventCallback) {
        self.callbacks.register(id, callback).await;
    }

    pub async fn unregister(&self, id: u64) {
        self.callbacks.unregister(id).await;
    }
}

/// Drain events from the sink, serialize each once, and deliver the bytes to
/// every registered callback.
async fn pump(callbacks: &Registry<Bytes>, mut source: mpsc::Receiver<Event>) {
    while let Some(event) = source.recv().await {
        let bytes = Bytes::from(event.encode_to_vec());
        callbacks.dispatch(bytes).await;
    }
    warn!("event sink closed, fanout dispatch loop ending");
}
