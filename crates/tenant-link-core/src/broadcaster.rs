//! Per-tenant fan-out of lifecycle events.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{LifecycleEvent, TenantId};

/// Default per-tenant channel capacity.
const DEFAULT_CAPACITY: usize = 64;

/// Lifecycle event broadcaster scoped by tenant.
///
/// Each tenant gets its own broadcast channel, so a subscriber for one
/// tenant can never observe another tenant's events. Delivery is
/// fire-and-forget: there is no history, and a publish with no live
/// subscribers is dropped.
pub struct EventBroadcaster {
    channels: RwLock<HashMap<TenantId, broadcast::Sender<LifecycleEvent>>>,
    capacity: usize,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    /// Create a broadcaster with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broadcaster whose per-tenant channels hold `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event to the tenant's current subscribers.
    pub fn publish(&self, tenant: &TenantId, event: LifecycleEvent) {
        let delivered = {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            channels.get(tenant).map(|sender| sender.send(event.clone()))
        };

        match delivered {
            Some(Ok(count)) => {
                tracing::debug!(tenant = %tenant, event = event.name(), subscribers = count, "Published event");
            }
            Some(Err(_)) => {
                // Every receiver is gone; drop the channel.
                let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
                if channels
                    .get(tenant)
                    .is_some_and(|sender| sender.receiver_count() == 0)
                {
                    channels.remove(tenant);
                }
            }
            None => {}
        }
    }

    /// Subscribe to a tenant's events.
    #[must_use]
    pub fn subscribe(&self, tenant: &TenantId) -> broadcast::Receiver<LifecycleEvent> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(tenant.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Stream of a tenant's events. Lagged gaps are skipped.
    #[must_use]
    pub fn subscribe_stream(
        &self,
        tenant: &TenantId,
    ) -> futures::stream::BoxStream<'static, LifecycleEvent> {
        BroadcastStream::new(self.subscribe(tenant))
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Number of live subscribers for a tenant.
    #[must_use]
    pub fn subscriber_count(&self, tenant: &TenantId) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}
