//! ==============================================================================
//! dispatcher.rs - liveness tracker and event dispatch
//! ==============================================================================
//!
//! purpose:
//!     owns the per-device state (latest reading + last seen time) and turns
//!     every accepted reading into subscriber notifications.
//!
//! ingest(sensor_data), in order:
//!     1. unknown id  -> discovery fan-out with the SensorData, wait for all
//!     2. write latest_reading / last_seen_at (new and known devices alike)
//!     3. update fan-out with a snapshot of every device's latest reading
//!
//! concurrency:
//!     - one gate (async mutex) per device id serializes the whole sequence
//!       above for that id, so two pushes from one device never race
//!     - different ids take different gates and run in parallel
//!     - the state map lock is only held for lookups, writes and the snapshot
//!       copy; never across a subscriber call
//!
//! relationships:
//!     - used by: server.rs (ingest), host code (queries)
//!     - uses: subscribers.rs (fan-out), domain.rs (state types)
//!
//! ==============================================================================

use crate::domain::{DeviceId, DeviceState, SensorData, Snapshot};
use crate::subscribers::Subscribers;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

pub struct Dispatcher {
    // TODO: entries are never evicted; add an optional size bound once a
    // deployment needs to forget retired devices
    states: RwLock<HashMap<DeviceId, DeviceState>>,
    gates: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
    subscribers: Arc<Subscribers>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_subscribers(Arc::new(Subscribers::new()))
    }

    /// share an existing registry, e.g. one the host populated before startup
    pub fn with_subscribers(subscribers: Arc<Subscribers>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            subscribers,
        }
    }

    pub fn subscribers(&self) -> &Arc<Subscribers> {
        &self.subscribers
    }

    async fn gate(&self, id: &DeviceId) -> Arc<Mutex<()>> {
        self.gates.lock().await.entry(id.clone()).or_default().clone()
    }

    // ==========================================================================
    // ingestion
    // ==========================================================================

    /// record one validated reading and notify subscribers.
    ///
    /// returns once every subscriber has finished. subscriber failures are
    /// logged by the fan-out and never undo the state write.
    pub async fn ingest(&self, data: SensorData) {
        let gate = self.gate(&data.id).await;
        let _serialized = gate.lock().await;

        let known = self.states.read().await.contains_key(&data.id);
        if !known {
            info!(device = %data.id, source = ?data.source_address, "discovered new device");
            self.subscribers.notify_discovery(&data).await;
        }

        let snapshot = {
            let mut states = self.states.write().await;
            let now = Utc::now();
            // wall clock may step back; last_seen_at must not
            let last_seen_at = states
                .get(&data.id)
                .map_or(now, |previous| previous.last_seen_at.max(now));

            states.insert(
                data.id.clone(),
                DeviceState {
                    latest_reading: Arc::new(data.reading),
                    last_seen_at,
                    source_address: data.source_address,
                },
            );
            snapshot_of(&states)
        };

        debug!(device = %data.id, devices = snapshot.len(), "publishing update");
        self.subscribers.notify_update(&data.id, snapshot).await;
    }

    // ==========================================================================
    // queries
    // ==========================================================================

    pub async fn device(&self, id: &DeviceId) -> Option<DeviceState> {
        self.states.read().await.get(id).cloned()
    }

    /// time of the most recent accepted reading from `id`
    pub async fn last_seen(&self, id: &DeviceId) -> Option<DateTime<Utc>> {
        self.states.read().await.get(id).map(|s| s.last_seen_at)
    }

    pub async fn is_available(&self, id: &DeviceId) -> bool {
        self.is_available_at(id, Utc::now()).await
    }

    /// unknown devices are never available
    pub async fn is_available_at(&self, id: &DeviceId, now: DateTime<Utc>) -> bool {
        self.states
            .read()
            .await
            .get(id)
            .is_some_and(|s| s.is_available_at(now))
    }

    pub async fn snapshot(&self) -> Snapshot {
        snapshot_of(&*self.states.read().await)
    }

    pub async fn device_count(&self) -> usize {
        self.states.read().await.len()
    }
}

fn snapshot_of(states: &HashMap<DeviceId, DeviceState>) -> Snapshot {
    let readings: BTreeMap<_, _> = states
        .iter()
        .map(|(id, state)| (id.clone(), state.latest_reading.clone()))
        .collect();
    Arc::new(readings)
}
