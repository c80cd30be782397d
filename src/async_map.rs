// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The demand-driven memoisation layer the engine is built on: a keyed map
//! whose values are produced at most once by a user-provided reader running
//! on the shared worker pool. Readers never block on other keys; they fan
//! out through a [`SubCaller`] and return, and the continuation runs as an
//! independent task once all requested keys have values.

use core::fmt::Display;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::task_system::TaskSystem;

/// Message sink for one consumer; `fatal = true` reports a failure.
pub type Logger = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Build a logger that rewrites messages before forwarding, used to add
/// breadcrumbs as failures propagate outwards.
pub fn wrap_logger(
    logger: &Logger,
    wrap: impl Fn(&str) -> String + Send + Sync + 'static,
) -> Logger {
    let logger = Arc::clone(logger);
    Arc::new(move |msg, fatal| logger(&wrap(msg), fatal))
}

/// One-shot success callback handed to a reader.
pub type Setter<V> = Box<dyn FnOnce(V) + Send>;

type Consumer<V> = Box<dyn FnOnce(&[V]) + Send>;

/// The reader computes the value for a key. It must either call the setter,
/// or report a fatal message through the logger; it must not block waiting
/// for other keys of the same map.
pub type Reader<K, V> =
    Arc<dyn Fn(&Arc<TaskSystem>, Setter<V>, Logger, SubCaller<K, V>, &K) + Send + Sync>;

/// A memoising, deduplicating, cycle-detecting keyed map.
pub struct AsyncMapConsumer<K, V> {
    core: Arc<MapCore<K, V>>,
}

impl<K, V> Clone for AsyncMapConsumer<K, V> {
    fn clone(&self) -> Self {
        AsyncMapConsumer {
            core: Arc::clone(&self.core),
        }
    }
}

/// Issues requests against the owning map on behalf of a key whose reader
/// is currently running; carries that key so request edges can be tracked
/// for cycle detection.
pub struct SubCaller<K, V> {
    core: Arc<MapCore<K, V>>,
    ts: Arc<TaskSystem>,
    origin: K,
}

impl<K, V> Clone for SubCaller<K, V>
where
    K: Clone,
{
    fn clone(&self) -> Self {
        SubCaller {
            core: Arc::clone(&self.core),
            ts: Arc::clone(&self.ts),
            origin: self.origin.clone(),
        }
    }
}

struct MapCore<K, V> {
    reader: Reader<K, V>,
    state: Mutex<MapState<K, V>>,
}

struct MapState<K, V> {
    entries: HashMap<K, EntryState<K, V>>,
    // waiting_on[a] is the set of keys a's pending request waits for; used
    // to detect request cycles before they deadlock.
    waiting_on: HashMap<K, HashSet<K>>,
}

enum EntryState<K, V> {
    InProgress { waiters: Vec<Waiter<K, V>> },
    Ready(V),
    Failed(String),
}

struct Waiter<K, V> {
    fanin: Arc<Fanin<V>>,
    slot: usize,
    origin: Option<K>,
}

struct Fanin<V> {
    slots: Mutex<Vec<Option<V>>>,
    remaining: AtomicUsize,
    failed: AtomicBool,
    cont: Mutex<Option<Consumer<V>>>,
    fail_logger: Logger,
}

impl<V: Clone + Send + 'static> Fanin<V> {
    fn deliver(&self, ts: &Arc<TaskSystem>, slot: usize, value: V) {
        self.slots.lock()[slot] = Some(value);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
            && !self.failed.load(Ordering::Acquire)
        {
            if let Some(cont) = self.cont.lock().take() {
                let values: Vec<V> = self
                    .slots
                    .lock()
                    .iter()
                    .filter_map(Option::clone)
                    .collect();
                ts.execute(move || cont(&values));
            }
        }
    }

    fn fail(&self, msg: &str) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            drop(self.cont.lock().take());
            (self.fail_logger)(msg, true);
        }
    }
}

impl<K, V> AsyncMapConsumer<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(reader: Reader<K, V>) -> AsyncMapConsumer<K, V> {
        AsyncMapConsumer {
            core: Arc::new(MapCore {
                reader,
                state: Mutex::new(MapState {
                    entries: HashMap::new(),
                    waiting_on: HashMap::new(),
                }),
            }),
        }
    }

    /// Schedule `cont` to run once every key has a value, in key order. If
    /// any key fails, `fail_logger` is notified instead and `cont` never
    /// runs.
    pub fn consume_after_keys_ready(
        &self,
        ts: &Arc<TaskSystem>,
        keys: &[K],
        cont: impl FnOnce(&[V]) + Send + 'static,
        fail_logger: Logger,
    ) {
        self.core.request(ts, None, keys, Box::new(cont), fail_logger);
    }
}

impl<K, V> MapCore<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn request(
        self: &Arc<Self>,
        ts: &Arc<TaskSystem>,
        origin: Option<&K>,
        keys: &[K],
        cont: Consumer<V>,
        fail_logger: Logger,
    ) {
        if ts.is_cancelled() {
            fail_logger("analysis aborted", true);
            return;
        }
        let fanin = Arc::new(Fanin {
            slots: Mutex::new(vec![None; keys.len()]),
            remaining: AtomicUsize::new(keys.len()),
            failed: AtomicBool::new(false),
            cont: Mutex::new(Some(cont)),
            fail_logger,
        });
        if keys.is_empty() {
            if let Some(cont) = fanin.cont.lock().take() {
                ts.execute(move || cont(&[]));
            }
            return;
        }

        let mut ready: Vec<(usize, V)> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut spawn: Vec<K> = Vec::new();
        let mut cycle_waiters: Vec<(Waiter<K, V>, String)> = Vec::new();
        {
            let mut state = self.state.lock();
            for (slot, key) in keys.iter().enumerate() {
                if let Some(o) = origin {
                    if let Some(cycle) = state.add_edge_checked(o, key) {
                        let msg = cycle_message(&cycle);
                        warn!("{msg}");
                        for k in &cycle {
                            for waiter in state.fail_entry(k, &msg) {
                                cycle_waiters.push((waiter, msg.clone()));
                            }
                        }
                        failures.push(msg);
                        continue;
                    }
                }
                match state.entries.get_mut(key) {
                    Some(EntryState::Ready(value)) => {
                        let value = value.clone();
                        state.remove_edge(origin, key);
                        ready.push((slot, value));
                    }
                    Some(EntryState::Failed(msg)) => {
                        let msg = msg.clone();
                        state.remove_edge(origin, key);
                        failures.push(msg);
                    }
                    Some(EntryState::InProgress { waiters }) => {
                        waiters.push(Waiter {
                            fanin: Arc::clone(&fanin),
                            slot,
                            origin: origin.cloned(),
                        });
                    }
                    None => {
                        state.entries.insert(
                            key.clone(),
                            EntryState::InProgress {
                                waiters: vec![Waiter {
                                    fanin: Arc::clone(&fanin),
                                    slot,
                                    origin: origin.cloned(),
                                }],
                            },
                        );
                        spawn.push(key.clone());
                    }
                }
            }
        }

        for (waiter, msg) in cycle_waiters {
            waiter.fanin.fail(&msg);
        }
        if let Some(msg) = failures.first() {
            fanin.fail(msg);
        }
        for (slot, value) in ready {
            fanin.deliver(ts, slot, value);
        }
        for key in spawn {
            let core = Arc::clone(self);
            let ts_task = Arc::clone(ts);
            ts.execute(move || core.run_reader(&ts_task, key));
        }
    }

    fn run_reader(self: &Arc<Self>, ts: &Arc<TaskSystem>, key: K) {
        debug!("processing key {key}");
        let setter: Setter<V> = {
            let core = Arc::clone(self);
            let ts = Arc::clone(ts);
            let key = key.clone();
            Box::new(move |value| core.set_value(&ts, &key, value))
        };
        let logger: Logger = {
            let core = Arc::clone(self);
            let key = key.clone();
            Arc::new(move |msg, fatal| {
                if fatal {
                    core.fail_key(&key, msg);
                } else {
                    warn!("while processing {key}: {msg}");
                }
            })
        };
        let subcaller = SubCaller {
            core: Arc::clone(self),
            ts: Arc::clone(ts),
            origin: key.clone(),
        };
        (self.reader)(ts, setter, logger, subcaller, &key);
    }

    fn set_value(self: &Arc<Self>, ts: &Arc<TaskSystem>, key: &K, value: V) {
        let waiters = {
            let mut state = self.state.lock();
            if let Some(EntryState::Failed(_)) = state.entries.get(key) {
                // The key was failed (e.g. as part of a cycle) while its
                // reader was still running; a late value does not revive it.
                return;
            }
            let waiters = match state
                .entries
                .insert(key.clone(), EntryState::Ready(value.clone()))
            {
                Some(EntryState::InProgress { waiters }) => waiters,
                _ => Vec::new(),
            };
            for waiter in &waiters {
                state.remove_edge(waiter.origin.as_ref(), key);
            }
            waiters
        };
        for waiter in waiters {
            waiter.fanin.deliver(ts, waiter.slot, value.clone());
        }
    }

    fn fail_key(self: &Arc<Self>, key: &K, msg: &str) {
        let waiters = {
            let mut state = self.state.lock();
            state.fail_entry(key, msg)
        };
        for waiter in waiters {
            waiter.fanin.fail(msg);
        }
    }
}

impl<K, V> MapState<K, V>
where
    K: Clone + Eq + Hash + Display,
{
    /// Record that `origin` waits on `key`. Returns the cycle path if that
    /// edge closes one.
    fn add_edge_checked(&mut self, origin: &K, key: &K) -> Option<Vec<K>> {
        if let Some(mut cycle) = self.path_between(key, origin) {
            cycle.insert(0, origin.clone());
            return Some(cycle);
        }
        self.waiting_on
            .entry(origin.clone())
            .or_default()
            .insert(key.clone());
        None
    }

    fn remove_edge(&mut self, origin: Option<&K>, key: &K) {
        if let Some(origin) = origin {
            if let Some(targets) = self.waiting_on.get_mut(origin) {
                targets.remove(key);
                if targets.is_empty() {
                    self.waiting_on.remove(origin);
                }
            }
        }
    }

    /// Depth-first search for a waiting path `from → … → to`.
    fn path_between(&self, from: &K, to: &K) -> Option<Vec<K>> {
        if from == to {
            return Some(vec![from.clone()]);
        }
        let mut visited = HashSet::new();
        let mut path = vec![from.clone()];
        self.dfs(from, to, &mut visited, &mut path).then_some(path)
    }

    fn dfs(&self, node: &K, to: &K, visited: &mut HashSet<K>, path: &mut Vec<K>) -> bool {
        if !visited.insert(node.clone()) {
            return false;
        }
        if let Some(targets) = self.waiting_on.get(node) {
            for next in targets {
                path.push(next.clone());
                if next == to || self.dfs(next, to, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    fn fail_entry(&mut self, key: &K, msg: &str) -> Vec<Waiter<K, V>> {
        let waiters = match self
            .entries
            .insert(key.clone(), EntryState::Failed(msg.to_string()))
        {
            Some(EntryState::InProgress { waiters }) => waiters,
            Some(other) => {
                // A resolved key keeps its value; do not regress it.
                self.entries.insert(key.clone(), other);
                Vec::new()
            }
            None => Vec::new(),
        };
        self.waiting_on.remove(key);
        for waiter in &waiters {
            let origin = waiter.origin.clone();
            self.remove_edge(origin.as_ref(), key);
        }
        waiters
    }
}

fn cycle_message<K: Display>(cycle: &[K]) -> String {
    let names: Vec<String> = cycle.iter().map(|k| format!("{k}")).collect();
    format!("dependency cycle detected involving: {}", names.join(" -> "))
}

impl<K, V> SubCaller<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Request further keys on behalf of the key whose reader created this
    /// sub-caller; semantics as `consume_after_keys_ready`.
    pub fn call(
        &self,
        keys: &[K],
        cont: impl FnOnce(&[V]) + Send + 'static,
        fail_logger: Logger,
    ) {
        self.core
            .request(&self.ts, Some(&self.origin), keys, Box::new(cont), fail_logger);
    }
}

impl<K, V> std::fmt::Debug for AsyncMapConsumer<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AsyncMapConsumer")
    }
}

impl<K, V> std::fmt::Debug for SubCaller<K, V>
where
    K: Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SubCaller({})", self.origin)
    }
}
