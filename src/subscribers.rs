//! ==============================================================================
//! subscribers.rs - subscription registry and fan-out
//! ==============================================================================
//!
//! purpose:
//!     holds the two independent callback sets the dispatcher publishes to:
//!     - discovery: called with the SensorData of a device seen for the first time
//!     - updates:   called with a snapshot of every device's latest reading
//!
//! concurrency:
//!     callbacks may be added or removed at any time, including from inside a
//!     running callback. a fan-out copies the current set first and releases
//!     the lock before calling anything, so:
//!     - a subscriber added mid fan-out only sees the next event
//!     - a subscriber removed mid fan-out still completes the current one
//!
//! failure isolation:
//!     each callback is polled concurrently with the others. an Err or a panic
//!     is logged and collected as a SubscriberError; the rest still run.
//!
//! relationships:
//!     - used by: dispatcher.rs (notify_discovery / notify_update)
//!     - used by: host code (subscribe_* / unsubscribe_*)
//!
//! ==============================================================================

use crate::domain::{DeviceId, SensorData, Snapshot};
use crate::error::SubscriberError;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

type DiscoveryCallback = Arc<dyn Fn(SensorData) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type UpdateCallback = Arc<dyn Fn(Snapshot) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// handle returned at registration, used to unregister
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    discovery: RwLock<BTreeMap<SubscriberId, DiscoveryCallback>>,
    updates: RwLock<BTreeMap<SubscriberId, UpdateCallback>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ==========================================================================
    // registration
    // ==========================================================================

    /// call `f` once for every device the dispatcher has never seen before
    pub async fn subscribe_discovery<F, Fut>(&self, f: F) -> SubscriberId
    where
        F: Fn(SensorData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.allocate_id();
        let callback: DiscoveryCallback = Arc::new(move |data| f(data).boxed());
        self.discovery.write().await.insert(id, callback);
        debug!("discovery subscriber {} registered", id);
        id
    }

    /// call `f` with the full reading snapshot after every accepted reading
    pub async fn subscribe_updates<F, Fut>(&self, f: F) -> SubscriberId
    where
        F: Fn(Snapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.allocate_id();
        let callback: UpdateCallback = Arc::new(move |snapshot| f(snapshot).boxed());
        self.updates.write().await.insert(id, callback);
        debug!("update subscriber {} registered", id);
        id
    }

    /// returns false if `id` was not registered
    pub async fn unsubscribe_discovery(&self, id: SubscriberId) -> bool {
        self.discovery.write().await.remove(&id).is_some()
    }

    /// returns false if `id` was not registered
    pub async fn unsubscribe_updates(&self, id: SubscriberId) -> bool {
        self.updates.write().await.remove(&id).is_some()
    }

    pub async fn discovery_count(&self) -> usize {
        self.discovery.read().await.len()
    }

    pub async fn update_count(&self) -> usize {
        self.updates.read().await.len()
    }

    // ==========================================================================
    // fan-out
    // ==========================================================================

    /// deliver a newly discovered device to every discovery subscriber
    pub async fn notify_discovery(&self, data: &SensorData) -> Vec<SubscriberError> {
        // copy the set; the lock is gone before any callback runs
        let targets: Vec<(SubscriberId, DiscoveryCallback)> = self
            .discovery
            .read()
            .await
            .iter()
            .map(|(id, callback)| (*id, callback.clone()))
            .collect();

        let calls = targets.into_iter().map(|(id, callback)| {
            let data = data.clone();
            // the call itself must run under catch_unwind in fan_out
            (id, async move { callback(data).await }.boxed())
        });
        fan_out("discovery", &data.id, calls).await
    }

    /// deliver the latest snapshot to every update subscriber
    pub async fn notify_update(&self, device: &DeviceId, snapshot: Snapshot) -> Vec<SubscriberError> {
        let targets: Vec<(SubscriberId, UpdateCallback)> = self
            .updates
            .read()
            .await
            .iter()
            .map(|(id, callback)| (*id, callback.clone()))
            .collect();

        let calls = targets.into_iter().map(|(id, callback)| {
            let snapshot = snapshot.clone();
            (id, async move { callback(snapshot).await }.boxed())
        });
        fan_out("update", device, calls).await
    }
}

/// run every call concurrently and wait for all of them
async fn fan_out<I>(kind: &'static str, device: &DeviceId, calls: I) -> Vec<SubscriberError>
where
    I: IntoIterator<Item = (SubscriberId, BoxFuture<'static, anyhow::Result<()>>)>,
{
    let pending: Vec<_> = calls
        .into_iter()
        .map(|(id, call)| async move {
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(source)) => Some(SubscriberError::Failed { id: id.0, source }),
                Err(_) => Some(SubscriberError::Panicked { id: id.0 }),
            }
        })
        .collect();

    if pending.is_empty() {
        return Vec::new();
    }

    let failures: Vec<SubscriberError> = join_all(pending).await.into_iter().flatten().collect();
    for failure in &failures {
        error!(device = %device, "{} {}", kind, failure);
    }
    failures
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceReading, ParticulateReading};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn sensor_data(id: &str) -> SensorData {
        SensorData {
            id: DeviceId::parse(id).unwrap(),
            source_address: Some("10.0.0.7".into()),
            reading: DeviceReading {
                wifi_rssi: -60,
                boot_count: 1,
                particulate: ParticulateReading {
                    pm01: 1,
                    pm02: 2,
                    pm10: 3,
                    pm003_count: None,
                    ambient_temp: 20.0,
                    relative_humidity: 40.0,
                },
                co2: None,
                tvoc_index: None,
                nox_index: None,
                channels: None,
            },
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let read = count.clone();
        (count, move || read.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_discovery_reaches_every_subscriber() {
        let subscribers = Subscribers::new();
        let (count, calls) = counter();

        for _ in 0..3 {
            let count = count.clone();
            subscribers
                .subscribe_discovery(move |data: SensorData| {
                    let count = count.clone();
                    async move {
                        assert_eq!(data.id.as_str(), "aabbccddeeff");
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await;
        }

        let failures = subscribers.notify_discovery(&sensor_data("aabbccddeeff")).await;
        assert!(failures.is_empty());
        assert_eq!(calls(), 3);
    }

    #[tokio::test]
    async fn test_failing_subscribers_are_isolated() {
        let subscribers = Subscribers::new();
        let (count, calls) = counter();

        subscribers
            .subscribe_discovery(|_| async { Err(anyhow::anyhow!("entity setup failed")) })
            .await;
        subscribers
            .subscribe_discovery(|data: SensorData| async move {
                let channels = data.reading.channels;
                channels.expect("subscriber bug");
                Ok(())
            })
            .await;
        let ok = count.clone();
        subscribers
            .subscribe_discovery(move |_| {
                let ok = ok.clone();
                async move {
                    ok.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let failures = subscribers.notify_discovery(&sensor_data("aabbccddeeff")).await;
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().any(|f| matches!(f, SubscriberError::Failed { .. })));
        assert!(failures.iter().any(|f| matches!(f, SubscriberError::Panicked { .. })));
        assert_eq!(calls(), 1);
    }

    #[tokio::test]
    async fn test_panic_before_returning_a_future_is_isolated() {
        let subscribers = Subscribers::new();
        let (count, calls) = counter();

        subscribers
            .subscribe_updates(|snapshot: Snapshot| {
                if snapshot.is_empty() {
                    panic!("no devices yet");
                }
                async { Ok(()) }
            })
            .await;
        subscribers
            .subscribe_updates(move |_| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let device = DeviceId::parse("aabbccddeeff").unwrap();
        let failures = subscribers.notify_update(&device, Arc::new(BTreeMap::new())).await;
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], SubscriberError::Panicked { .. }));
        assert_eq!(calls(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let subscribers = Subscribers::new();
        let (count, calls) = counter();

        let id = subscribers
            .subscribe_updates(move |_| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let device = DeviceId::parse("aabbccddeeff").unwrap();
        subscribers.notify_update(&device, Arc::new(BTreeMap::new())).await;
        assert!(subscribers.unsubscribe_updates(id).await);
        assert!(!subscribers.unsubscribe_updates(id).await);
        subscribers.notify_update(&device, Arc::new(BTreeMap::new())).await;

        assert_eq!(calls(), 1);
        assert_eq!(subscribers.update_count().await, 0);
    }

    #[tokio::test]
    async fn test_registration_from_inside_a_callback() {
        let subscribers = Arc::new(Subscribers::new());
        let (count, calls) = counter();

        // the first callback registers a second one; the second must not see
        // the event that is already being delivered
        let registry = subscribers.clone();
        subscribers
            .subscribe_updates(move |_| {
                let registry = registry.clone();
                let count = count.clone();
                async move {
                    registry
                        .subscribe_updates(move |_| {
                            let count = count.clone();
                            async move {
                                count.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        })
                        .await;
                    Ok(())
                }
            })
            .await;

        let device = DeviceId::parse("aabbccddeeff").unwrap();
        subscribers.notify_update(&device, Arc::new(BTreeMap::new())).await;
        assert_eq!(calls(), 0);
        assert_eq!(subscribers.update_count().await, 2);

        subscribers.notify_update(&device, Arc::new(BTreeMap::new())).await;
        assert_eq!(calls(), 1);
    }

    #[tokio::test]
    async fn test_self_removal_during_fan_out() {
        let subscribers = Arc::new(Subscribers::new());
        let (count, calls) = counter();

        let registry = subscribers.clone();
        let own_id = Arc::new(std::sync::OnceLock::new());
        let slot = own_id.clone();
        let id = subscribers
            .subscribe_discovery(move |_| {
                let registry = registry.clone();
                let slot = slot.clone();
                let count = count.clone();
                async move {
                    if let Some(id) = slot.get() {
                        registry.unsubscribe_discovery(*id).await;
                    }
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        own_id.set(id).unwrap();

        subscribers.notify_discovery(&sensor_data("aabbccddeeff")).await;
        subscribers.notify_discovery(&sensor_data("001122334455")).await;

        assert_eq!(calls(), 1);
        assert_eq!(subscribers.discovery_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_set_is_a_no_op() {
        let subscribers = Subscribers::new();
        let device = DeviceId::parse("aabbccddeeff").unwrap();
        assert!(subscribers.notify_update(&device, Arc::new(BTreeMap::new())).await.is_empty());
        assert!(subscribers.notify_discovery(&sensor_data("aabbccddeeff")).await.is_empty());
    }
}
