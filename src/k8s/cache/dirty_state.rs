/**
 * Dirty State Aggregator
 *
 * Classifies watch callbacks into per-kind change lists between two render
 * cycles, coalesces bursts of changes behind a debounce timer and hands the
 * accumulated state to the render consumer with an atomic read-and-clear.
 */
use super::config::CacheConfig;
use super::debounce::{DebounceTimer, UpdateNotifier};
use super::event::{ChangeEvent, WatchedObject};
use super::object_key::ObjectKey;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Key/value content of a config map
pub type ConfigData = BTreeMap<String, String>;

/// Drops whatever credential material was derived from a deleted secret
pub trait CredentialInvalidator: Send + Sync {
    fn invalidate(&self, secret: &ObjectKey);
}

/// Objects of one kind that were added, updated or deleted within a window
///
/// The lists are independent: an object added and then deleted inside the
/// same window shows up in both `added` and `deleted`.
#[derive(Debug, Clone)]
pub struct ChangeSet<K> {
    pub added: Vec<Arc<K>>,
    pub updated: Vec<Arc<K>>,
    pub deleted: Vec<Arc<K>>,
}

impl<K> Default for ChangeSet<K> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<K> ChangeSet<K> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }

    fn record(&mut self, old: Option<Arc<K>>, new: Option<Arc<K>>) {
        match (old, new) {
            (Some(old), None) => self.deleted.push(old),
            (None, Some(new)) => self.added.push(new),
            (Some(_), Some(new)) => self.updated.push(new),
            (None, None) => {}
        }
    }
}

/// Current and pending content of one distinguished config map
///
/// `pending` holds content observed since the last sync; it becomes
/// `current` only when a sync promotes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub current: Option<ConfigData>,
    pub pending: Option<ConfigData>,
}

impl ConfigSnapshot {
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.pending.is_some()
    }

    /// The content in effect after a sync
    #[must_use]
    pub fn effective(&self) -> Option<&ConfigData> {
        self.pending.as_ref().or(self.current.as_ref())
    }

    fn promote(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.current = Some(pending);
        }
    }
}

/// Everything that changed between two sync calls
#[derive(Debug, Clone, Default)]
pub struct DirtySnapshot {
    pub ingresses: ChangeSet<Ingress>,
    pub services: ChangeSet<Service>,
    pub secrets: ChangeSet<Secret>,
    /// Endpoints observations, every change relevant regardless of add/update
    pub endpoints: Vec<Arc<Endpoints>>,
    /// Pod observations, every change relevant regardless of add/update
    pub pods: Vec<Arc<Pod>>,
    /// `current` is the content before this sync, `pending` the content now in effect
    pub global_config: ConfigSnapshot,
    pub tcp_config: ConfigSnapshot,
    pub need_full_resync: bool,
}

impl DirtySnapshot {
    /// No object changed and no resync was requested
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ingresses.is_empty()
            && self.services.is_empty()
            && self.secrets.is_empty()
            && self.endpoints.is_empty()
            && self.pods.is_empty()
            && !self.global_config.changed()
            && !self.tcp_config.changed()
            && !self.need_full_resync
    }
}

#[derive(Debug, Default)]
struct ConfigSlot {
    key: Option<ObjectKey>,
    snapshot: ConfigSnapshot,
}

impl ConfigSlot {
    fn new(key: Option<ObjectKey>) -> Self {
        Self {
            key,
            snapshot: ConfigSnapshot::default(),
        }
    }

    fn matches(&self, key: &ObjectKey) -> bool {
        self.key.as_ref() == Some(key)
    }
}

#[derive(Debug)]
struct DirtyState {
    ingresses: ChangeSet<Ingress>,
    services: ChangeSet<Service>,
    secrets: ChangeSet<Secret>,
    endpoints: Vec<Arc<Endpoints>>,
    pods: Vec<Arc<Pod>>,
    global_config: ConfigSlot,
    tcp_config: ConfigSlot,
    need_resync: bool,
    timer: DebounceTimer,
}

/// Accumulates watch callbacks until the render consumer syncs
///
/// `on_change` and `sync` take the lock exclusively; read-only queries
/// share it. The read and the clear of a sync happen under one exclusive
/// lock so no concurrent `on_change` can fall between them.
pub struct DirtyStateAggregator {
    state: RwLock<DirtyState>,
    invalidator: Option<Arc<dyn CredentialInvalidator>>,
}

impl DirtyStateAggregator {
    /// Build an aggregator signalling `notifier` after each debounce window
    #[must_use]
    pub fn new(config: &CacheConfig, notifier: Arc<dyn UpdateNotifier>) -> Self {
        Self::with_delay(
            config.global_config_map.clone(),
            config.tcp_config_map.clone(),
            config.debounce_delay,
            notifier,
        )
    }

    #[must_use]
    pub fn with_delay(
        global_config_map: Option<ObjectKey>,
        tcp_config_map: Option<ObjectKey>,
        delay: Duration,
        notifier: Arc<dyn UpdateNotifier>,
    ) -> Self {
        Self {
            state: RwLock::new(DirtyState {
                ingresses: ChangeSet::default(),
                services: ChangeSet::default(),
                secrets: ChangeSet::default(),
                endpoints: Vec::new(),
                pods: Vec::new(),
                global_config: ConfigSlot::new(global_config_map),
                tcp_config: ConfigSlot::new(tcp_config_map),
                need_resync: false,
                timer: DebounceTimer::new(delay, notifier),
            }),
            invalidator: None,
        }
    }

    /// Hook invoked synchronously whenever a secret is deleted
    #[must_use]
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CredentialInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn apply(&self, event: ChangeEvent) {
        self.on_change(event.old, event.new);
    }

    /// Classify one watch callback; never fails
    pub fn on_change(&self, old: Option<WatchedObject>, new: Option<WatchedObject>) {
        let mut state = self.write_state();

        if old.is_none() && new.is_none() {
            debug!("🔄 Full resync requested");
            state.need_resync = true;
        }

        if let (Some(old), None) = (&old, &new) {
            trace!("🗑️  {} deleted: {}", old.kind(), old.key());
        }

        match (old, new) {
            (old, Some(WatchedObject::Ingress(new))) => {
                state.ingresses.record(old.map(|_| Arc::clone(&new)), Some(new));
            }
            (Some(WatchedObject::Ingress(old)), None) => state.ingresses.record(Some(old), None),
            (old, Some(WatchedObject::Service(new))) => {
                state.services.record(old.map(|_| Arc::clone(&new)), Some(new));
            }
            (Some(WatchedObject::Service(old)), None) => state.services.record(Some(old), None),
            (old, Some(WatchedObject::Secret(new))) => {
                state.secrets.record(old.map(|_| Arc::clone(&new)), Some(new));
            }
            (Some(WatchedObject::Secret(old)), None) => {
                let key = ObjectKey::from_resource(old.as_ref());
                state.secrets.record(Some(old), None);
                if let Some(invalidator) = &self.invalidator {
                    invalidator.invalidate(&key);
                }
            }
            (_, Some(WatchedObject::Endpoints(new))) => state.endpoints.push(new),
            (_, Some(WatchedObject::Pod(new))) => state.pods.push(new),
            (_, Some(WatchedObject::ConfigMap(new))) => Self::stage_config(&mut state, &new),
            // deletions of endpoints, pods and config maps carry no render input
            (Some(_), None) | (None, None) => {}
        }

        if state.timer.arm() {
            debug!("⏳ Changes pending, debounce timer armed");
        }
    }

    fn stage_config(state: &mut DirtyState, config_map: &ConfigMap) {
        let key = ObjectKey::from_resource(config_map);
        let data = config_map.data.clone().unwrap_or_default();
        if state.global_config.matches(&key) {
            debug!("📝 Global config map changed: {}", key);
            state.global_config.snapshot.pending = Some(data);
        } else if state.tcp_config.matches(&key) {
            debug!("📝 TCP config map changed: {}", key);
            state.tcp_config.snapshot.pending = Some(data);
        } else {
            debug!("Ignoring unrelated config map {}", key);
        }
    }

    /// Atomically take everything accumulated since the previous sync
    ///
    /// Pending config content is promoted to current, the lists and the
    /// resync flag are cleared and the debounce timer may arm again.
    pub fn sync(&self) -> DirtySnapshot {
        let mut state = self.write_state();

        let snapshot = DirtySnapshot {
            ingresses: std::mem::take(&mut state.ingresses),
            services: std::mem::take(&mut state.services),
            secrets: std::mem::take(&mut state.secrets),
            endpoints: std::mem::take(&mut state.endpoints),
            pods: std::mem::take(&mut state.pods),
            global_config: state.global_config.snapshot.clone(),
            tcp_config: state.tcp_config.snapshot.clone(),
            need_full_resync: state.need_resync,
        };

        state.global_config.snapshot.promote();
        state.tcp_config.snapshot.promote();
        state.need_resync = false;
        state.timer.reset();
        drop(state);

        if !snapshot.is_empty() {
            info!(
                "📦 Synced changes: {} ingresses, {} services, {} secrets, {} endpoints, {} pods, resync={}",
                snapshot.ingresses.len(),
                snapshot.services.len(),
                snapshot.secrets.len(),
                snapshot.endpoints.len(),
                snapshot.pods.len(),
                snapshot.need_full_resync
            );
        }
        snapshot
    }

    #[must_use]
    pub fn need_full_resync(&self) -> bool {
        self.read_state().need_resync
    }

    #[must_use]
    pub fn global_config(&self) -> ConfigSnapshot {
        self.read_state().global_config.snapshot.clone()
    }

    #[must_use]
    pub fn tcp_config(&self) -> ConfigSnapshot {
        self.read_state().tcp_config.snapshot.clone()
    }

    /// Whether a debounce timer is armed for the current window
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.read_state().timer.is_armed()
    }

    // classification never fails, poisoning included
    fn write_state(&self) -> RwLockWriteGuard<'_, DirtyState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, DirtyState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DirtyStateAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyStateAggregator")
            .field("state", &self.state)
            .field("invalidator", &self.invalidator.is_some())
            .finish()
    }
}
