//! A registry kept in process memory.
//!
//! Implements the same read, write and watch traits as the Windows registry
//! so the inventory and the watcher can run against a deterministic store.
//! Paths are case sensitive here, unlike the real registry.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::keys::{KeyPath, KeyRead, RegistryError, RegistryRead, RegistryWrite};
use crate::watch::{NotifyFilter, NotifySource, RegistryWatch, StopSignal, WatchError, WatchScope, Wakeup};

const ERROR_KEY_DELETED: u32 = 1018;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    ExpandString(String),
    Dword(u32),
    Binary(Vec<u8>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    open_handles: AtomicUsize,
    max_open_handles: AtomicUsize,
    next_source: AtomicU64,
}

#[derive(Default)]
struct State {
    keys: BTreeMap<KeyPath, BTreeMap<String, Value>>,
    denied: HashSet<KeyPath>,
    /// Mutations not yet seen by every live notification source.
    log: VecDeque<Mutation>,
    /// Sequence number of the front of `log`.
    log_start: u64,
    /// Next unseen sequence number, per live notification source.
    sources: HashMap<u64, u64>,
    subscription_failure: Option<u32>,
}

struct Mutation {
    key: KeyPath,
    change: Change,
}

#[derive(Clone, Copy, PartialEq)]
enum Change {
    Subkeys,
    Values,
    Deleted,
}

impl State {
    fn exists(&self, key: &KeyPath) -> bool {
        key.path.is_empty() || self.keys.contains_key(key)
    }

    fn check_open(&self, key: &KeyPath) -> Result<(), RegistryError> {
        if self.denied.contains(key) {
            return Err(RegistryError::AccessDenied(key.clone()));
        }
        if !self.exists(key) {
            return Err(RegistryError::NotFound(key.clone()));
        }
        Ok(())
    }

    fn create(&mut self, key: &KeyPath) {
        if self.exists(key) {
            return;
        }
        if let Some(parent) = key.parent() {
            self.create(&parent);
            self.record(parent, Change::Subkeys);
        }
        self.keys.insert(key.clone(), BTreeMap::new());
    }

    /// Nothing is kept while no source is listening.
    fn record(&mut self, key: KeyPath, change: Change) {
        if !self.sources.is_empty() {
            self.log.push_back(Mutation { key, change });
        }
    }

    fn log_end(&self) -> u64 {
        self.log_start + self.log.len() as u64
    }

    /// Drops the mutations every live source has already scanned.
    fn trim(&mut self) {
        let oldest = self.sources.values().copied().min().unwrap_or_else(|| self.log_end());
        while self.log_start < oldest && self.log.pop_front().is_some() {
            self.log_start += 1;
        }
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `key` and any missing ancestors.
    pub fn create_key(&self, key: &KeyPath) {
        let mut state = self.shared.state.lock();
        state.create(key);
        self.shared.changed.notify_all();
    }

    pub fn set_value(&self, key: &KeyPath, name: &str, value: Value) {
        let mut state = self.shared.state.lock();
        state.create(key);
        if let Some(values) = state.keys.get_mut(key) {
            values.insert(name.to_string(), value);
        }
        state.record(key.clone(), Change::Values);
        self.shared.changed.notify_all();
    }

    pub fn contains(&self, key: &KeyPath) -> bool {
        self.shared.state.lock().exists(key)
    }

    /// Makes every later open of `key` fail with access denied.
    pub fn deny(&self, key: &KeyPath) {
        self.shared.state.lock().denied.insert(key.clone());
    }

    /// The next change subscription on any key fails with `status`.
    pub fn fail_next_subscription(&self, status: u32) {
        self.shared.state.lock().subscription_failure = Some(status);
    }

    /// Keys currently held open, including watcher handles.
    pub fn open_handles(&self) -> usize {
        self.shared.open_handles.load(Ordering::SeqCst)
    }

    /// The highest number of keys that were ever open at the same time.
    pub fn max_open_handles(&self) -> usize {
        self.shared.max_open_handles.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn pending_mutations(&self) -> usize {
        self.shared.state.lock().log.len()
    }

    fn handle(&self, path: KeyPath) -> MemoryKey {
        let open = self.shared.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_open_handles.fetch_max(open, Ordering::SeqCst);
        MemoryKey {
            registry: self.clone(),
            path,
        }
    }
}

impl RegistryRead for MemoryRegistry {
    type Key = MemoryKey;

    fn open_key(&self, key: &KeyPath) -> Result<MemoryKey, RegistryError> {
        self.shared.state.lock().check_open(key)?;
        Ok(self.handle(key.clone()))
    }
}

impl RegistryWrite for MemoryRegistry {
    fn delete_tree(&self, key: &KeyPath) -> Result<(), RegistryError> {
        let mut state = self.shared.state.lock();
        state.check_open(key)?;

        let doomed: Vec<KeyPath> = state
            .keys
            .keys()
            .filter(|k| *k == key || k.is_descendant_of(key))
            .cloned()
            .collect();
        for path in doomed {
            state.keys.remove(&path);
            state.record(path, Change::Deleted);
        }
        if let Some(parent) = key.parent() {
            state.record(parent, Change::Subkeys);
        }

        trace!("Deleted {}", key);
        self.shared.changed.notify_all();
        Ok(())
    }
}

impl RegistryWatch for MemoryRegistry {
    type Source = MemoryNotifySource;

    fn notify_source(&self, key: &KeyPath) -> Result<MemoryNotifySource, RegistryError> {
        let key = self.open_key(key)?;
        let id = self.shared.next_source.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        let seen = state.log_end();
        state.sources.insert(id, seen);
        Ok(MemoryNotifySource {
            key,
            id,
            seen,
            armed: None,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// An open key. Counts as one handle until dropped.
pub struct MemoryKey {
    registry: MemoryRegistry,
    path: KeyPath,
}

impl Drop for MemoryKey {
    fn drop(&mut self) {
        self.registry.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl KeyRead for MemoryKey {
    fn key_path(&self) -> &KeyPath {
        &self.path
    }

    fn subkey_names(&self) -> Result<Vec<String>, RegistryError> {
        let state = self.registry.shared.state.lock();
        if !state.exists(&self.path) {
            return Err(RegistryError::NotFound(self.path.clone()));
        }
        Ok(state
            .keys
            .keys()
            .filter(|k| k.parent().as_ref() == Some(&self.path))
            .map(|k| k.leaf().to_string())
            .collect())
    }

    fn open_subkey(&self, name: &str) -> Result<MemoryKey, RegistryError> {
        self.registry.open_key(&self.path.child(name))
    }

    fn string_value(&self, name: &str) -> Option<String> {
        let state = self.registry.shared.state.lock();
        match state.keys.get(&self.path)?.get(name)? {
            Value::String(s) | Value::ExpandString(s) => Some(s.clone()),
            _ => None,
        }
    }
}

pub struct MemoryNotifySource {
    key: MemoryKey,
    id: u64,
    seen: u64,
    armed: Option<(NotifyFilter, WatchScope)>,
    stop: Arc<AtomicBool>,
}

pub struct MemoryStop {
    registry: MemoryRegistry,
    stop: Arc<AtomicBool>,
}

impl StopSignal for MemoryStop {
    fn signal(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // Taking the lock orders the flag against a waiter that is between
        // its check and its wait.
        let _state = self.registry.shared.state.lock();
        self.registry.shared.changed.notify_all();
    }
}

impl Drop for MemoryNotifySource {
    fn drop(&mut self) {
        let mut state = self.key.registry.shared.state.lock();
        state.sources.remove(&self.id);
        state.trim();
    }
}

impl MemoryNotifySource {
    fn is_relevant(&self, mutation: &Mutation, filter: NotifyFilter, scope: WatchScope) -> bool {
        let watched = &self.key.path;
        if mutation.change == Change::Deleted && mutation.key == *watched {
            return true;
        }

        let in_scope = mutation.key == *watched
            || (scope == WatchScope::KeyAndSubtree && mutation.key.is_descendant_of(watched));
        let wanted = match mutation.change {
            Change::Subkeys | Change::Deleted => NotifyFilter::KEY,
            Change::Values => NotifyFilter::VALUE,
        };
        in_scope && filter.contains(wanted)
    }
}

impl NotifySource for MemoryNotifySource {
    type Stop = MemoryStop;

    fn stop_handle(&self) -> MemoryStop {
        MemoryStop {
            registry: self.key.registry.clone(),
            stop: Arc::clone(&self.stop),
        }
    }

    fn subscribe(&mut self, filter: NotifyFilter, scope: WatchScope) -> Result<(), WatchError> {
        let mut state = self.key.registry.shared.state.lock();
        if let Some(status) = state.subscription_failure.take() {
            return Err(WatchError::Subscribe { status });
        }
        if !state.exists(&self.key.path) {
            return Err(WatchError::Subscribe { status: ERROR_KEY_DELETED });
        }
        self.armed = Some((filter, scope));
        Ok(())
    }

    fn wait(&mut self) -> Result<Wakeup, WatchError> {
        let (filter, scope) = self.armed.take().ok_or_else(|| WatchError::Wait {
            message: "no subscription armed".to_string(),
        })?;

        let registry = self.key.registry.clone();
        let mut state = registry.shared.state.lock();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(Wakeup::Stop);
            }

            let skip = (self.seen - state.log_start) as usize;
            let fired = state
                .log
                .iter()
                .skip(skip)
                .any(|m| self.is_relevant(m, filter, scope));
            self.seen = state.log_end();
            state.sources.insert(self.id, self.seen);
            state.trim();
            if fired {
                return Ok(Wakeup::Changed);
            }

            registry.shared.changed.wait(&mut state);
        }
    }

    fn key_exists(&self) -> Result<bool, WatchError> {
        Ok(self.key.registry.contains(&self.key.path))
    }
}
