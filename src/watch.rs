//! Change notification for a single registry key.
//!
//! A [`KeyWatcher`] owns one background thread. The thread arms a change
//! subscription on the key, then blocks in a single wait that returns either
//! when the key changes or when the owner asks it to stop, so shutdown never
//! sits behind an unbounded OS wait.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::keys::{Hive, KeyPath, RegistryError};

/// Which kinds of change wake the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifyFilter(u32);

impl NotifyFilter {
    /// A subkey is added or deleted.
    pub const KEY: NotifyFilter = NotifyFilter(0x1);
    /// Attributes of the key change.
    pub const ATTRIBUTE: NotifyFilter = NotifyFilter(0x2);
    /// A value is added, deleted or modified.
    pub const VALUE: NotifyFilter = NotifyFilter(0x4);
    /// The security descriptor changes.
    pub const SECURITY: NotifyFilter = NotifyFilter(0x8);
    pub const ALL: NotifyFilter = NotifyFilter(0xF);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn empty() -> Self {
        NotifyFilter(0)
    }

    pub const fn contains(self, other: NotifyFilter) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for NotifyFilter {
    fn default() -> Self {
        NotifyFilter::ALL
    }
}

impl BitOr for NotifyFilter {
    type Output = NotifyFilter;

    fn bitor(self, rhs: NotifyFilter) -> NotifyFilter {
        NotifyFilter(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchScope {
    KeyOnly,
    #[default]
    KeyAndSubtree,
}

/// What ended a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Stop,
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Changed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub key: KeyPath,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Watching,
    Stopped,
    Faulted,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("cannot open {0} for notification")]
    Open(#[source] RegistryError),
    #[error("change subscription failed with status {status}")]
    Subscribe { status: u32 },
    #[error("waiting for a change failed: {message}")]
    Wait { message: String },
    #[error("cannot tell whether the key still exists")]
    Existence(#[source] RegistryError),
    #[error("cannot start the watcher thread")]
    Spawn(#[source] std::io::Error),
    #[error("the watcher was already disposed")]
    AlreadyDisposed,
}

/// Wakes a blocked [`NotifySource::wait`] from another thread.
pub trait StopSignal: Send + Sync {
    fn signal(&self);
}

/// A held key handle plus the two things a watcher waits on.
pub trait NotifySource: Send + 'static {
    type Stop: StopSignal + 'static;

    fn stop_handle(&self) -> Self::Stop;

    /// Arms a one-shot change subscription on the held key.
    fn subscribe(&mut self, filter: NotifyFilter, scope: WatchScope) -> Result<(), WatchError>;

    /// Blocks until the subscription fires or stop is signalled. Stop wins
    /// when both are pending.
    fn wait(&mut self) -> Result<Wakeup, WatchError>;

    /// Reopens the key by path to see whether it was deleted.
    fn key_exists(&self) -> Result<bool, WatchError>;
}

pub trait RegistryWatch {
    type Source: NotifySource;

    fn notify_source(&self, key: &KeyPath) -> Result<Self::Source, RegistryError>;
}

/// Shared by the owner and the worker thread.
#[derive(Debug)]
struct Control {
    state: Mutex<WatchState>,
    /// Set before the stop signal is raised, and held while a change is delivered.
    stopping: Mutex<bool>,
}

impl Control {
    fn new() -> Self {
        Control {
            state: Mutex::new(WatchState::Watching),
            stopping: Mutex::new(false),
        }
    }

    fn stop(&self, signal: &dyn StopSignal) {
        *self.stopping.lock() = true;
        signal.signal();
    }

    /// Runs `deliver` unless a stop was requested. A stop racing with it
    /// blocks until the delivery is over.
    fn deliver(&self, deliver: impl FnOnce()) -> bool {
        let stopping = self.stopping.lock();
        if *stopping {
            return false;
        }
        deliver();
        true
    }
}

pub struct KeyWatcher {
    key: KeyPath,
    filter: NotifyFilter,
    scope: WatchScope,
    stop: Box<dyn StopSignal>,
    worker: Option<JoinHandle<()>>,
    control: Arc<Control>,
    disposed: bool,
}

impl fmt::Debug for KeyWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyWatcher")
            .field("key", &self.key)
            .field("filter", &self.filter)
            .field("scope", &self.scope)
            .field("state", &self.state())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl KeyWatcher {
    /// Opens `key` and starts watching it right away.
    ///
    /// `on_change` runs on the watcher thread for every change; `on_error` runs
    /// at most once, after which the watcher is dead. No change is delivered
    /// after `request_stop` or `dispose` returns. `on_change` must not stop or
    /// dispose its own watcher, since those wait for the delivery to finish.
    pub fn start<R, C, E>(
        registry: &R,
        key: KeyPath,
        filter: NotifyFilter,
        scope: WatchScope,
        on_change: C,
        on_error: E,
    ) -> Result<KeyWatcher, WatchError>
    where
        R: RegistryWatch + ?Sized,
        C: FnMut(KeyChange) + Send + 'static,
        E: FnOnce(WatchError) + Send + 'static,
    {
        let source = registry.notify_source(&key).map_err(WatchError::Open)?;
        let stop = source.stop_handle();
        let control = Arc::new(Control::new());

        let worker = {
            let key = key.clone();
            let control = Arc::clone(&control);
            thread::Builder::new()
                .name(format!("watch {}", key.leaf()))
                .spawn(move || run(source, key, filter, scope, on_change, on_error, control))
                .map_err(WatchError::Spawn)?
        };

        debug!("Watching {} (filter {:#x}, {:?})", key, filter.bits(), scope);

        Ok(KeyWatcher {
            key,
            filter,
            scope,
            stop: Box::new(stop),
            worker: Some(worker),
            control,
            disposed: false,
        })
    }

    pub fn hive(&self) -> Hive {
        self.key.hive
    }

    pub fn key_path(&self) -> &KeyPath {
        &self.key
    }

    pub fn scope(&self) -> WatchScope {
        self.scope
    }

    pub fn filter(&self) -> NotifyFilter {
        self.filter
    }

    pub fn state(&self) -> WatchState {
        *self.control.state.lock()
    }

    /// True while the worker thread has not exited.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Asks the worker to exit without waiting for it.
    pub fn request_stop(&self) {
        self.control.stop(self.stop.as_ref());
    }

    /// Stops the worker and waits for it. The key handle is closed once this returns.
    pub fn dispose(&mut self) -> Result<(), WatchError> {
        if self.disposed {
            return Err(WatchError::AlreadyDisposed);
        }
        self.disposed = true;

        self.control.stop(self.stop.as_ref());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Watcher thread for {} panicked", self.key);
            }
        }
        trace!("Disposed watcher for {}", self.key);
        Ok(())
    }
}

impl Drop for KeyWatcher {
    fn drop(&mut self) {
        if !self.disposed {
            let _ = self.dispose();
        }
    }
}

fn run<S, C, E>(
    mut source: S,
    key: KeyPath,
    filter: NotifyFilter,
    scope: WatchScope,
    mut on_change: C,
    on_error: E,
    control: Arc<Control>,
) where
    S: NotifySource,
    C: FnMut(KeyChange),
    E: FnOnce(WatchError),
{
    match watch_loop(&mut source, &key, filter, scope, &mut on_change, &control) {
        Ok(()) => {
            *control.state.lock() = WatchState::Stopped;
            trace!("Watcher for {} stopped", key);
        }
        Err(e) => {
            *control.state.lock() = WatchState::Faulted;
            warn!("Watcher for {} failed: {}", key, e);
            on_error(e);
        }
    }
    // `source` drops here, closing the key handle before the thread exits.
}

fn watch_loop<S, C>(
    source: &mut S,
    key: &KeyPath,
    filter: NotifyFilter,
    scope: WatchScope,
    on_change: &mut C,
    control: &Control,
) -> Result<(), WatchError>
where
    S: NotifySource,
    C: FnMut(KeyChange),
{
    loop {
        source.subscribe(filter, scope)?;

        match source.wait()? {
            Wakeup::Stop => return Ok(()),
            Wakeup::Changed => {
                let deleted = !source.key_exists()?;
                let kind = if deleted { ChangeKind::Deleted } else { ChangeKind::Changed };

                let delivered = control.deliver(|| {
                    trace!("{} {:?}", key, kind);
                    on_change(KeyChange { key: key.clone(), kind });
                });
                if !delivered || deleted {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RegistryWrite;
    use crate::memory::{MemoryRegistry, Value};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(150);

    fn uninstall_key() -> KeyPath {
        KeyPath::new(Hive::CurrentUser, r"Software\Microsoft\Windows\CurrentVersion\Uninstall")
    }

    fn watch(
        registry: &MemoryRegistry,
        filter: NotifyFilter,
        scope: WatchScope,
    ) -> (KeyWatcher, mpsc::Receiver<KeyChange>, mpsc::Receiver<WatchError>) {
        let (changes_tx, changes) = mpsc::channel();
        let (errors_tx, errors) = mpsc::channel();
        let watcher = KeyWatcher::start(
            registry,
            uninstall_key(),
            filter,
            scope,
            move |change| {
                let _ = changes_tx.send(change);
            },
            move |e| {
                let _ = errors_tx.send(e);
            },
        )
        .unwrap();
        (watcher, changes, errors)
    }

    struct NoStop;

    impl StopSignal for NoStop {
        fn signal(&self) {}
    }

    /// Replays fixed wakeups. Optionally requests a stop while checking
    /// whether the key exists, as an owner calling `request_stop` right then would.
    struct ScriptedSource {
        wakeups: Vec<Wakeup>,
        control: Arc<Control>,
        stop_during_check: bool,
    }

    impl NotifySource for ScriptedSource {
        type Stop = NoStop;

        fn stop_handle(&self) -> NoStop {
            NoStop
        }

        fn subscribe(&mut self, _filter: NotifyFilter, _scope: WatchScope) -> Result<(), WatchError> {
            Ok(())
        }

        fn wait(&mut self) -> Result<Wakeup, WatchError> {
            Ok(if self.wakeups.is_empty() { Wakeup::Stop } else { self.wakeups.remove(0) })
        }

        fn key_exists(&self) -> Result<bool, WatchError> {
            if self.stop_during_check {
                self.control.stop(&NoStop);
            }
            Ok(true)
        }
    }

    fn run_scripted(wakeups: Vec<Wakeup>, stop_during_check: bool) -> (Vec<KeyChange>, bool, WatchState) {
        let control = Arc::new(Control::new());
        let source = ScriptedSource {
            wakeups,
            control: Arc::clone(&control),
            stop_during_check,
        };
        let mut events = Vec::new();
        let mut failed = false;

        run(
            source,
            uninstall_key(),
            NotifyFilter::ALL,
            WatchScope::KeyAndSubtree,
            |change| events.push(change),
            |_| failed = true,
            Arc::clone(&control),
        );

        let state = *control.state.lock();
        (events, failed, state)
    }

    fn wait_until_finished(watcher: &KeyWatcher) {
        let started = Instant::now();
        while watcher.is_running() {
            assert!(started.elapsed() < TIMEOUT, "watcher thread did not exit");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_filter_flags() {
        let filter = NotifyFilter::KEY | NotifyFilter::VALUE;

        assert!(filter.contains(NotifyFilter::KEY));
        assert!(!filter.contains(NotifyFilter::SECURITY));
        assert_eq!(NotifyFilter::default(), NotifyFilter::ALL);
        assert_eq!(
            NotifyFilter::KEY | NotifyFilter::ATTRIBUTE | NotifyFilter::VALUE | NotifyFilter::SECURITY,
            NotifyFilter::ALL
        );
    }

    #[test]
    fn test_accessors_report_configuration() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        let (watcher, _changes, _errors) = watch(&registry, NotifyFilter::VALUE, WatchScope::KeyOnly);

        assert_eq!(watcher.hive(), Hive::CurrentUser);
        assert_eq!(watcher.key_path(), &uninstall_key());
        assert_eq!(watcher.scope(), WatchScope::KeyOnly);
        assert_eq!(watcher.filter(), NotifyFilter::VALUE);
        assert_eq!(watcher.state(), WatchState::Watching);
    }

    #[test]
    fn test_changes_are_reported_repeatedly() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        let (mut watcher, changes, _errors) = watch(&registry, NotifyFilter::ALL, WatchScope::KeyAndSubtree);

        registry.set_value(&uninstall_key().child("App"), "DisplayName", Value::from("App"));
        let first = changes.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(first, KeyChange { key: uninstall_key(), kind: ChangeKind::Changed });

        registry.set_value(&uninstall_key().child("App"), "DisplayName", Value::from("App 2"));
        let second = changes.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(second.kind, ChangeKind::Changed);

        watcher.dispose().unwrap();
        assert_eq!(watcher.state(), WatchState::Stopped);
    }

    #[test]
    fn test_deleting_key_reports_once_and_ends_thread() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        let (mut watcher, changes, errors) = watch(&registry, NotifyFilter::ALL, WatchScope::KeyAndSubtree);

        registry.delete_tree(&uninstall_key()).unwrap();

        let change = changes.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(change.kind, ChangeKind::Deleted);
        wait_until_finished(&watcher);
        assert_eq!(watcher.state(), WatchState::Stopped);
        assert!(changes.recv_timeout(QUIET).is_err());
        assert!(errors.try_recv().is_err());

        watcher.dispose().unwrap();
    }

    #[test]
    fn test_stop_while_blocked_is_prompt_and_silent() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        let (mut watcher, changes, errors) = watch(&registry, NotifyFilter::ALL, WatchScope::KeyAndSubtree);
        thread::sleep(QUIET);

        let started = Instant::now();
        watcher.dispose().unwrap();

        assert!(started.elapsed() < TIMEOUT);
        assert!(!watcher.is_running());
        assert_eq!(watcher.state(), WatchState::Stopped);

        registry.set_value(&uninstall_key(), "Late", Value::from("change"));
        assert!(changes.recv_timeout(QUIET).is_err());
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn test_dispose_releases_key_handle() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        let (mut watcher, _changes, _errors) = watch(&registry, NotifyFilter::ALL, WatchScope::KeyAndSubtree);
        assert_eq!(registry.open_handles(), 1);

        watcher.dispose().unwrap();

        assert_eq!(registry.open_handles(), 0);
    }

    #[test]
    fn test_second_dispose_is_an_error() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        let (mut watcher, _changes, _errors) = watch(&registry, NotifyFilter::ALL, WatchScope::KeyAndSubtree);

        watcher.dispose().unwrap();

        assert!(matches!(watcher.dispose(), Err(WatchError::AlreadyDisposed)));
    }

    #[test]
    fn test_subscription_failure_faults_once() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        registry.fail_next_subscription(5);
        let (mut watcher, changes, errors) = watch(&registry, NotifyFilter::ALL, WatchScope::KeyAndSubtree);

        let error = errors.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(error, WatchError::Subscribe { status: 5 }));
        wait_until_finished(&watcher);
        assert_eq!(watcher.state(), WatchState::Faulted);

        registry.set_value(&uninstall_key(), "After", Value::from("fault"));
        assert!(changes.recv_timeout(QUIET).is_err());
        assert!(errors.try_recv().is_err());
        watcher.dispose().unwrap();
    }

    #[test]
    fn test_missing_key_cannot_be_watched() {
        let registry = MemoryRegistry::new();

        let result = KeyWatcher::start(
            &registry,
            uninstall_key(),
            NotifyFilter::ALL,
            WatchScope::KeyAndSubtree,
            |_| {},
            |_| {},
        );

        assert!(matches!(result, Err(WatchError::Open(RegistryError::NotFound(_)))));
    }

    #[test]
    fn test_key_only_scope_ignores_nested_values() {
        let registry = MemoryRegistry::new();
        let app = uninstall_key().child("App");
        registry.create_key(&app);
        let (mut watcher, changes, _errors) = watch(&registry, NotifyFilter::ALL, WatchScope::KeyOnly);

        registry.set_value(&app, "DisplayName", Value::from("App"));
        assert!(changes.recv_timeout(QUIET).is_err());

        registry.create_key(&uninstall_key().child("Other"));
        assert_eq!(changes.recv_timeout(TIMEOUT).unwrap().kind, ChangeKind::Changed);

        watcher.dispose().unwrap();
    }

    #[test]
    fn test_value_filter_ignores_subkey_changes() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        let (mut watcher, changes, _errors) = watch(&registry, NotifyFilter::VALUE, WatchScope::KeyOnly);

        registry.create_key(&uninstall_key().child("Other"));
        assert!(changes.recv_timeout(QUIET).is_err());

        registry.set_value(&uninstall_key(), "Marker", Value::Dword(1));
        assert_eq!(changes.recv_timeout(TIMEOUT).unwrap().kind, ChangeKind::Changed);

        watcher.dispose().unwrap();
    }

    #[test]
    fn test_stop_during_existence_check_suppresses_event() {
        let (events, failed, state) = run_scripted(vec![Wakeup::Changed, Wakeup::Changed], true);

        assert!(events.is_empty());
        assert!(!failed);
        assert_eq!(state, WatchState::Stopped);
    }

    #[test]
    fn test_scripted_changes_are_delivered_until_stop() {
        let (events, failed, state) = run_scripted(vec![Wakeup::Changed, Wakeup::Changed], false);

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == ChangeKind::Changed));
        assert!(!failed);
        assert_eq!(state, WatchState::Stopped);
    }

    #[test]
    fn test_no_change_is_delivered_after_request_stop() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        let (mut watcher, changes, _errors) = watch(&registry, NotifyFilter::ALL, WatchScope::KeyAndSubtree);

        registry.set_value(&uninstall_key(), "Before", Value::from("stop"));
        watcher.request_stop();
        let delivered_before_stop = changes.try_iter().count();
        registry.set_value(&uninstall_key(), "After", Value::from("stop"));

        watcher.dispose().unwrap();
        assert!(delivered_before_stop <= 1);
        assert_eq!(changes.try_iter().count(), 0);
    }

    #[test]
    fn test_dropping_watcher_stops_it_silently() {
        let registry = MemoryRegistry::new();
        registry.create_key(&uninstall_key());
        let (watcher, changes, errors) = watch(&registry, NotifyFilter::ALL, WatchScope::KeyAndSubtree);
        assert_eq!(registry.open_handles(), 1);

        drop(watcher);

        assert_eq!(registry.open_handles(), 0);
        registry.set_value(&uninstall_key(), "Late", Value::from("change"));
        assert!(changes.recv_timeout(QUIET).is_err());
        assert!(errors.try_recv().is_err());
    }
}
