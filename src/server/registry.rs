//! Copy-then-swap registries and per-rule bookkeeping.
//!
//! # Design Decisions
//! - Readers clone an `Arc` snapshot under a short read lock and never see a
//!   half-applied mutation
//! - Writers copy the map, mutate the copy and swap it in under the write lock
//! - Tunnels are indexed by id and by owning rule in one snapshot, so both
//!   views always agree
//! - A tunnel rule lives in an `ArcSwap` so filters can replace it while
//!   accept loops keep reading it

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use uuid::Uuid;

use crate::net::acceptor::{AcceptHandler, Acceptor, IncomingHandler};
use crate::rule::{ServiceRule, TunnelRule};
use crate::service::ActiveService;

/// A hash map replaced wholesale on every mutation.
pub struct CowMap<K, V> {
    inner: RwLock<Arc<HashMap<K, V>>>,
}

impl<K, V> CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn snapshot(&self) -> Arc<HashMap<K, V>> {
        Arc::clone(&self.inner.read())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Copy, mutate, swap. Returns whatever `mutate` returns.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        let mut guard = self.inner.write();
        let mut copy = HashMap::clone(&guard);
        let result = mutate(&mut copy);
        *guard = Arc::new(copy);
        result
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.update(|map| map.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        if !self.contains(key) {
            return None;
        }
        self.update(|map| map.remove(key))
    }

    /// Empty the map, returning the last snapshot.
    pub fn take_all(&self) -> Arc<HashMap<K, V>> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(HashMap::new()))
    }
}

impl<K, V> Default for CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for CowMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CowMap").field("len", &self.inner.read().len()).finish()
    }
}

struct Grouped<K, G, V> {
    entries: HashMap<K, (G, V)>,
    groups: HashMap<G, HashSet<K>>,
}

impl<K, G, V> Clone for Grouped<K, G, V>
where
    K: Clone,
    G: Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            groups: self.groups.clone(),
        }
    }
}

impl<K, G, V> Grouped<K, G, V>
where
    K: Eq + Hash + Clone,
    G: Eq + Hash + Clone,
{
    fn detach(&mut self, key: &K) -> Option<V> {
        let (group, value) = self.entries.remove(key)?;
        if let Some(keys) = self.groups.get_mut(&group) {
            keys.remove(key);
            if keys.is_empty() {
                self.groups.remove(&group);
            }
        }
        Some(value)
    }
}

/// Copy-then-swap map with a secondary index by group. Holds the active
/// tunnels, keyed by tunnel id and grouped by rule UUID.
pub struct GroupedMap<K, G, V> {
    inner: RwLock<Arc<Grouped<K, G, V>>>,
}

impl<K, G, V> GroupedMap<K, G, V>
where
    K: Eq + Hash + Clone,
    G: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Grouped {
                entries: HashMap::new(),
                groups: HashMap::new(),
            })),
        }
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut Grouped<K, G, V>) -> R) -> R {
        let mut guard = self.inner.write();
        let mut copy = Grouped::clone(&guard);
        let result = mutate(&mut copy);
        *guard = Arc::new(copy);
        result
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn group_len(&self, group: &G) -> usize {
        self.inner.read().groups.get(group).map_or(0, HashSet::len)
    }

    pub fn values(&self) -> Vec<V> {
        let snapshot = Arc::clone(&self.inner.read());
        snapshot.entries.values().map(|(_, value)| value.clone()).collect()
    }

    /// Insert or move `key` into `group`.
    pub fn insert(&self, key: K, group: G, value: V) -> Option<V> {
        self.update(|map| {
            let previous = map.detach(&key);
            map.groups.entry(group.clone()).or_default().insert(key.clone());
            map.entries.insert(key, (group, value));
            previous
        })
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        if !self.inner.read().entries.contains_key(key) {
            return None;
        }
        self.update(|map| map.detach(key))
    }

    /// Remove the whole group, visiting only its own entries.
    pub fn remove_group(&self, group: &G) -> Vec<V> {
        if !self.inner.read().groups.contains_key(group) {
            return Vec::new();
        }
        self.update(|map| {
            let keys = map.groups.remove(group).unwrap_or_default();
            keys.iter()
                .filter_map(|key| map.entries.remove(key).map(|(_, value)| value))
                .collect()
        })
    }

    pub fn take_all(&self) -> Vec<V> {
        let taken = std::mem::replace(
            &mut *self.inner.write(),
            Arc::new(Grouped {
                entries: HashMap::new(),
                groups: HashMap::new(),
            }),
        );
        taken.entries.values().map(|(_, value)| value.clone()).collect()
    }
}

impl<K, G, V> Default for GroupedMap<K, G, V>
where
    K: Eq + Hash + Clone,
    G: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, G, V> fmt::Debug for GroupedMap<K, G, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("GroupedMap")
            .field("len", &inner.entries.len())
            .field("groups", &inner.groups.len())
            .finish()
    }
}

/// An accepting input of an active rule.
pub struct ActiveInput {
    pub endpoint: Uuid,
    pub handler: AcceptHandler,
    /// Strong owner of the accept loop's weak handler.
    pub target: Arc<dyn IncomingHandler>,
}

/// Runtime state of an active tunnel rule.
pub struct RuleInfo {
    pub uuid: Uuid,
    rule: ArcSwap<TunnelRule>,
    inputs: Mutex<Vec<ActiveInput>>,
    accepted: AtomicU64,
    stop_tx: watch::Sender<bool>,
}

impl RuleInfo {
    pub fn new(rule: Arc<TunnelRule>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            uuid: rule.uuid,
            rule: ArcSwap::new(rule),
            inputs: Mutex::new(Vec::new()),
            accepted: AtomicU64::new(0),
            stop_tx,
        })
    }

    /// Current rule, as last changed by a filter.
    pub fn rule(&self) -> Arc<TunnelRule> {
        self.rule.load_full()
    }

    pub fn replace_rule(&self, rule: TunnelRule) {
        self.rule.store(Arc::new(rule));
    }

    pub fn add_input(&self, input: ActiveInput) {
        self.inputs.lock().push(input);
    }

    pub fn inputs_number(&self) -> usize {
        self.inputs.lock().len()
    }

    pub fn acceptor(&self, endpoint: Uuid) -> Option<Arc<dyn Acceptor>> {
        self.inputs
            .lock()
            .iter()
            .find(|input| input.endpoint == endpoint)
            .map(|input| Arc::clone(input.handler.acceptor()))
    }

    /// Count one accepted connection; true once the limit is reached.
    pub fn count_accepted(&self) -> bool {
        let limit = self.rule.load().accepted_connections_limit;
        let accepted = self.accepted.fetch_add(1, Ordering::AcqRel) + 1;
        limit > 0 && accepted >= limit
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Acquire)
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Stop filters and every accept loop, waiting for the loops to exit.
    pub async fn deactivate(&self) {
        self.stop_tx.send_replace(true);
        let inputs = std::mem::take(&mut *self.inputs.lock());
        for input in &inputs {
            input.handler.stop().await;
        }
        tracing::debug!(rule = %self.uuid, inputs = inputs.len(), "Rule inputs closed");
    }
}

impl fmt::Debug for RuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleInfo")
            .field("uuid", &self.uuid)
            .field("inputs", &self.inputs_number())
            .field("accepted", &self.accepted())
            .finish()
    }
}

/// Entry of the active rules registry.
#[derive(Debug, Clone)]
pub enum ActiveRule {
    Tunnel(Arc<RuleInfo>),
    Service(Arc<ServiceRule>),
}

/// Services started for one service rule.
pub type ActiveServices = Vec<Arc<ActiveService>>;

/// A tunnel rule waiting for the rules check.
#[derive(Debug, Clone)]
pub struct Recheck {
    pub rule: Arc<TunnelRule>,
    /// Consecutive failed attempts.
    pub failures: u32,
    pub not_before: Instant,
}
