//! Watch handle facade
//!
//! A [`WatchHandle`] is one registration against a directory-watch facility,
//! scoped to a path, a recursion flag, a name filter and a change-reason
//! mask. Upper layers only ever talk to this trait, never to backend types:
//! - [`NotifyWatchHandle`] binds it to the `notify` crate
//! - [`crate::testing::FakeWatchHandle`] is a scriptable test double
//!
//! Raw notifications are delivered to at most one listener per
//! [`NativeEventKind`], on the handle's own notification thread.

mod notify_handle;

pub use notify_handle::{NotifyHandleFactory, NotifyWatchHandle};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, WatchError};
use crate::event::{ChangeReasons, WaitForChangeResult, WatcherChangeTypes};

/// Listener slot a raw notification is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeEventKind {
    Created,
    Changed,
    Deleted,
    Renamed,
    Error,
}

/// Raw change as reported by a handle, names relative to `directory`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub directory: PathBuf,
    pub name: Option<PathBuf>,
}

impl RawChange {
    pub fn new(directory: impl Into<PathBuf>, name: Option<PathBuf>) -> Self {
        Self { directory: directory.into(), name }
    }
}

/// Raw notification emitted by a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    Created(RawChange),
    Changed(RawChange),
    Deleted(RawChange),
    Renamed { change: RawChange, old_name: PathBuf },
    Error(WatchError),
}

impl NativeEvent {
    pub fn kind(&self) -> NativeEventKind {
        match self {
            NativeEvent::Created(_) => NativeEventKind::Created,
            NativeEvent::Changed(_) => NativeEventKind::Changed,
            NativeEvent::Deleted(_) => NativeEventKind::Deleted,
            NativeEvent::Renamed { .. } => NativeEventKind::Renamed,
            NativeEvent::Error(_) => NativeEventKind::Error,
        }
    }

    fn change_type(&self) -> Option<WatcherChangeTypes> {
        match self {
            NativeEvent::Created(_) => Some(WatcherChangeTypes::CREATED),
            NativeEvent::Changed(_) => Some(WatcherChangeTypes::CHANGED),
            NativeEvent::Deleted(_) => Some(WatcherChangeTypes::DELETED),
            NativeEvent::Renamed { .. } => Some(WatcherChangeTypes::RENAMED),
            NativeEvent::Error(_) => None,
        }
    }
}

/// Callback wired to one listener slot
pub type NativeListener = Arc<dyn Fn(NativeEvent) + Send + Sync>;

/// Everything needed to register a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSettings {
    pub path: Option<PathBuf>,
    pub recursive: bool,
    pub name_filter: String,
    pub change_reasons: ChangeReasons,
}

impl HandleSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()), ..Self::default() }
    }

    pub fn with_filter(mut self, name_filter: impl Into<String>) -> Self {
        self.name_filter = name_filter.into();
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_change_reasons(mut self, change_reasons: ChangeReasons) -> Self {
        self.change_reasons = change_reasons;
        self
    }

    /// Same scope, narrowed to exactly one change reason
    pub fn scoped_to(&self, reason: ChangeReasons) -> Self {
        Self { change_reasons: reason, ..self.clone() }
    }
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            path: None,
            recursive: false,
            name_filter: glob_utils::MATCH_ALL.to_string(),
            change_reasons: ChangeReasons::DEFAULT,
        }
    }
}

/// Uniform capability surface over one native directory watch
pub trait WatchHandle: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Idempotent; false -> true starts native delivery, true -> false stops it.
    /// Notifications already in flight may still arrive briefly after disabling.
    fn set_enabled(&self, enabled: bool) -> Result<()>;

    fn path(&self) -> Option<PathBuf>;
    fn set_path(&self, path: &Path) -> Result<()>;

    fn recursive(&self) -> bool;
    fn set_recursive(&self, recursive: bool) -> Result<()>;

    fn name_filter(&self) -> String;
    fn set_name_filter(&self, filter: &str) -> Result<()>;

    fn change_reasons(&self) -> ChangeReasons;
    /// Rejects masks carrying unknown bits
    fn set_change_reasons(&self, reasons: ChangeReasons) -> Result<()>;

    /// Wire (`Some`) or unwire (`None`) the listener for one slot
    fn set_listener(&self, kind: NativeEventKind, listener: Option<NativeListener>);

    /// Block until a matching raw change arrives or the timeout elapses
    fn wait_for_change(
        &self,
        change_types: WatcherChangeTypes,
        timeout: Option<Duration>,
    ) -> Result<WaitForChangeResult>;

    /// Release the native resource; calling it again is a no-op
    fn dispose(&self);
    fn is_disposed(&self) -> bool;

    fn settings(&self) -> HandleSettings {
        HandleSettings {
            path: self.path(),
            recursive: self.recursive(),
            name_filter: self.name_filter(),
            change_reasons: self.change_reasons(),
        }
    }

    /// Push a whole settings snapshot onto the handle
    fn apply_settings(&self, settings: &HandleSettings) -> Result<()> {
        if let Some(path) = &settings.path {
            self.set_path(path)?;
        }
        self.set_recursive(settings.recursive)?;
        self.set_name_filter(&settings.name_filter)?;
        self.set_change_reasons(settings.change_reasons)
    }
}

/// Creates handles, used wherever a watcher needs more than the one it was given
pub trait HandleFactory: Send + Sync {
    fn create(&self, settings: &HandleSettings) -> Result<Box<dyn WatchHandle>>;
}

/// Listener slots shared by handle implementations
#[derive(Default)]
pub(crate) struct ListenerSlots {
    slots: RwLock<HashMap<NativeEventKind, NativeListener>>,
}

impl ListenerSlots {
    pub(crate) fn set(&self, kind: NativeEventKind, listener: Option<NativeListener>) {
        let mut slots = self.slots.write();
        match listener {
            Some(listener) => {
                slots.insert(kind, listener);
            }
            None => {
                slots.remove(&kind);
            }
        }
    }

    pub(crate) fn is_wired(&self, kind: NativeEventKind) -> bool {
        self.slots.read().contains_key(&kind)
    }

    /// Deliver to the wired listener, if any; the lock is not held during the call
    pub(crate) fn emit(&self, event: NativeEvent) {
        let listener = self.slots.read().get(&event.kind()).cloned();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    pub(crate) fn clear(&self) {
        self.slots.write().clear();
    }
}

struct Waiter {
    id: u64,
    change_types: WatcherChangeTypes,
    tx: Sender<WaitForChangeResult>,
}

/// One-shot waiters registered by `wait_for_change`
#[derive(Default)]
pub(crate) struct Waiters {
    next_id: Mutex<u64>,
    waiters: Mutex<Vec<Waiter>>,
}

impl Waiters {
    pub(crate) fn register(
        &self,
        change_types: WatcherChangeTypes,
    ) -> (u64, crossbeam_channel::Receiver<WaitForChangeResult>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = {
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            *next_id
        };
        self.waiters.lock().push(Waiter { id, change_types, tx });
        (id, rx)
    }

    pub(crate) fn remove(&self, id: u64) {
        self.waiters.lock().retain(|waiter| waiter.id != id);
    }

    /// Complete every waiter interested in this event
    pub(crate) fn notify(&self, event: &NativeEvent) {
        let Some(change_type) = event.change_type() else {
            return;
        };
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return;
        }
        let result = match event {
            NativeEvent::Created(change) | NativeEvent::Changed(change) | NativeEvent::Deleted(change) => {
                WaitForChangeResult {
                    change_type: Some(change_type),
                    name: change.name.clone(),
                    old_name: None,
                    timed_out: false,
                }
            }
            NativeEvent::Renamed { change, old_name } => WaitForChangeResult {
                change_type: Some(change_type),
                name: change.name.clone(),
                old_name: Some(old_name.clone()),
                timed_out: false,
            },
            NativeEvent::Error(_) => return,
        };
        waiters.retain(|waiter| {
            if waiter.change_types.intersects(change_type) {
                let _ = waiter.tx.try_send(result.clone());
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn clear(&self) {
        self.waiters.lock().clear();
    }
}

/// Shared body of `wait_for_change` for handle implementations
pub(crate) fn wait_on(
    handle: &dyn WatchHandle,
    waiters: &Waiters,
    change_types: WatcherChangeTypes,
    timeout: Option<Duration>,
) -> Result<WaitForChangeResult> {
    let change_types = change_types.validate()?;
    if handle.is_disposed() {
        return Err(WatchError::Disposed);
    }

    let (id, rx) = waiters.register(change_types);
    let was_enabled = handle.is_enabled();
    if !was_enabled {
        if let Err(error) = handle.set_enabled(true) {
            waiters.remove(id);
            return Err(error);
        }
    }

    let outcome = match timeout {
        Some(timeout) => rx.recv_timeout(timeout).ok(),
        None => rx.recv().ok(),
    };

    waiters.remove(id);
    if !was_enabled {
        handle.set_enabled(false)?;
    }

    Ok(outcome.unwrap_or_else(WaitForChangeResult::timed_out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scoped_settings_keep_scope() {
        let settings = HandleSettings::new("/data")
            .with_filter("*.log")
            .with_recursive(true)
            .with_change_reasons(ChangeReasons::all());
        let scoped = settings.scoped_to(ChangeReasons::SIZE);
        assert_eq!(scoped.path, settings.path);
        assert_eq!(scoped.name_filter, "*.log");
        assert!(scoped.recursive);
        assert_eq!(scoped.change_reasons, ChangeReasons::SIZE);
    }

    #[test]
    fn test_listener_slots_route_by_kind() {
        let slots = ListenerSlots::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        slots.set(
            NativeEventKind::Created,
            Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        slots.emit(NativeEvent::Created(RawChange::new("/d", None)));
        slots.emit(NativeEvent::Deleted(RawChange::new("/d", None)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        slots.set(NativeEventKind::Created, None);
        assert!(!slots.is_wired(NativeEventKind::Created));
        slots.emit(NativeEvent::Created(RawChange::new("/d", None)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiters_complete_only_matching_types() {
        let waiters = Waiters::default();
        let (_, created_rx) = waiters.register(WatcherChangeTypes::CREATED);
        let (_, renamed_rx) = waiters.register(WatcherChangeTypes::RENAMED);

        waiters.notify(&NativeEvent::Created(RawChange::new("/d", Some("a".into()))));
        let result = created_rx.try_recv().unwrap();
        assert_eq!(result.change_type, Some(WatcherChangeTypes::CREATED));
        assert_eq!(result.name, Some(PathBuf::from("a")));
        assert!(renamed_rx.try_recv().is_err());
    }
}
