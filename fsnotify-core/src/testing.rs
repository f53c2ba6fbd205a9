//! Scriptable test doubles for the watch handle facade
//!
//! [`FakeWatchHandle`] never touches the filesystem. Tests inject raw
//! notifications with [`FakeWatchHandle::emit`] and inspect how often the
//! handle was enabled, disabled and disposed. Clones share state, so a test
//! can keep one clone as a probe after boxing another into a watcher.

use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, WatchError};
use crate::event::{ChangeReasons, WaitForChangeResult, WatcherChangeTypes};
use crate::handle::{
    wait_on, HandleFactory, HandleSettings, ListenerSlots, NativeEvent, NativeEventKind,
    NativeListener, RawChange, WatchHandle, Waiters,
};

#[derive(Default)]
struct FakeState {
    settings: RwLock<HandleSettings>,
    enabled: AtomicBool,
    disposed: AtomicBool,
    listeners: ListenerSlots,
    waiters: Waiters,
    enable_calls: AtomicUsize,
    disable_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
    fail_enable: Mutex<Option<WatchError>>,
}

/// In-memory [`WatchHandle`]
#[derive(Clone, Default)]
pub struct FakeWatchHandle {
    state: Arc<FakeState>,
}

impl FakeWatchHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_settings(HandleSettings::new(path))
    }

    pub fn with_settings(settings: HandleSettings) -> Self {
        let handle = Self::default();
        *handle.state.settings.write() = settings;
        handle
    }

    /// Box a clone for handing to a watcher, keeping `self` as a probe
    pub fn boxed(&self) -> Box<dyn WatchHandle> {
        Box::new(self.clone())
    }

    /// Make the next `set_enabled(true)` fail with `error`
    pub fn fail_next_enable(&self, error: WatchError) {
        *self.state.fail_enable.lock() = Some(error);
    }

    /// Deliver a raw notification as the native layer would
    ///
    /// Returns false when the handle is disabled or disposed, in which case
    /// nothing is delivered.
    pub fn emit(&self, event: NativeEvent) -> bool {
        if !self.is_enabled() || self.is_disposed() {
            return false;
        }
        self.state.waiters.notify(&event);
        self.state.listeners.emit(event);
        true
    }

    pub fn emit_created(&self, name: &str) -> bool {
        self.emit(NativeEvent::Created(self.raw(name)))
    }

    pub fn emit_changed(&self, name: &str) -> bool {
        self.emit(NativeEvent::Changed(self.raw(name)))
    }

    pub fn emit_deleted(&self, name: &str) -> bool {
        self.emit(NativeEvent::Deleted(self.raw(name)))
    }

    pub fn emit_renamed(&self, old_name: &str, name: &str) -> bool {
        self.emit(NativeEvent::Renamed { change: self.raw(name), old_name: PathBuf::from(old_name) })
    }

    pub fn emit_error(&self, error: WatchError) -> bool {
        self.emit(NativeEvent::Error(error))
    }

    pub fn is_wired(&self, kind: NativeEventKind) -> bool {
        self.state.listeners.is_wired(kind)
    }

    pub fn enable_count(&self) -> usize {
        self.state.enable_calls.load(Ordering::SeqCst)
    }

    pub fn disable_count(&self) -> usize {
        self.state.disable_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_count(&self) -> usize {
        self.state.dispose_calls.load(Ordering::SeqCst)
    }

    fn raw(&self, name: &str) -> RawChange {
        let directory = self.state.settings.read().path.clone().unwrap_or_default();
        RawChange::new(directory, Some(PathBuf::from(name)))
    }
}

impl WatchHandle for FakeWatchHandle {
    fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            if self.is_disposed() {
                return Err(WatchError::Disposed);
            }
            if self.state.settings.read().path.is_none() {
                return Err(WatchError::MissingPath);
            }
            if let Some(error) = self.state.fail_enable.lock().take() {
                return Err(error);
            }
        }
        if self.state.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            let counter = if enabled { &self.state.enable_calls } else { &self.state.disable_calls };
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn path(&self) -> Option<PathBuf> {
        self.state.settings.read().path.clone()
    }

    fn set_path(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(WatchError::invalid_argument("watch path must not be empty"));
        }
        self.state.settings.write().path = Some(path.to_path_buf());
        Ok(())
    }

    fn recursive(&self) -> bool {
        self.state.settings.read().recursive
    }

    fn set_recursive(&self, recursive: bool) -> Result<()> {
        self.state.settings.write().recursive = recursive;
        Ok(())
    }

    fn name_filter(&self) -> String {
        self.state.settings.read().name_filter.clone()
    }

    fn set_name_filter(&self, filter: &str) -> Result<()> {
        let filter = glob_utils::NameFilter::new(filter)?;
        self.state.settings.write().name_filter = filter.pattern().to_string();
        Ok(())
    }

    fn change_reasons(&self) -> ChangeReasons {
        self.state.settings.read().change_reasons
    }

    fn set_change_reasons(&self, reasons: ChangeReasons) -> Result<()> {
        self.state.settings.write().change_reasons = reasons.ensure_valid()?;
        Ok(())
    }

    fn set_listener(&self, kind: NativeEventKind, listener: Option<NativeListener>) {
        self.state.listeners.set(kind, listener);
    }

    fn wait_for_change(
        &self,
        change_types: WatcherChangeTypes,
        timeout: Option<Duration>,
    ) -> Result<WaitForChangeResult> {
        wait_on(self, &self.state.waiters, change_types, timeout)
    }

    fn dispose(&self) {
        self.state.dispose_calls.fetch_add(1, Ordering::SeqCst);
        self.state.disposed.store(true, Ordering::SeqCst);
        self.state.enabled.store(false, Ordering::SeqCst);
        self.state.listeners.clear();
        self.state.waiters.clear();
    }

    fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }
}

/// [`HandleFactory`] producing [`FakeWatchHandle`]s and remembering each one
#[derive(Default)]
pub struct FakeHandleFactory {
    created: Mutex<Vec<FakeWatchHandle>>,
    fail_next: Mutex<Option<WatchError>>,
}

impl FakeHandleFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every handle created so far, in creation order
    pub fn handles(&self) -> Vec<FakeWatchHandle> {
        self.created.lock().clone()
    }

    /// The most recent live handle scoped to exactly `reason`
    pub fn handle_for(&self, reason: ChangeReasons) -> Option<FakeWatchHandle> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|handle| handle.change_reasons() == reason && !handle.is_disposed())
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Make the next `create` fail with `error`
    pub fn fail_next(&self, error: WatchError) {
        *self.fail_next.lock() = Some(error);
    }
}

impl HandleFactory for FakeHandleFactory {
    fn create(&self, settings: &HandleSettings) -> Result<Box<dyn WatchHandle>> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        let handle = FakeWatchHandle::with_settings(settings.clone());
        self.created.lock().push(handle.clone());
        Ok(handle.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_requires_enabled_handle() {
        let handle = FakeWatchHandle::new("/fake");
        assert!(!handle.emit_created("a"));
        handle.set_enabled(true).unwrap();
        assert!(handle.emit_created("a"));
        handle.dispose();
        assert!(!handle.emit_created("a"));
    }

    #[test]
    fn test_counts_transitions_only() {
        let handle = FakeWatchHandle::new("/fake");
        handle.set_enabled(true).unwrap();
        handle.set_enabled(true).unwrap();
        handle.set_enabled(false).unwrap();
        assert_eq!(handle.enable_count(), 1);
        assert_eq!(handle.disable_count(), 1);
    }

    #[test]
    fn test_wait_for_change_through_fake() {
        let handle = FakeWatchHandle::new("/fake");
        handle.set_enabled(true).unwrap();
        let source = handle.clone();
        let emitter = std::thread::spawn(move || {
            // Retry until the waiter is registered
            for _ in 0..100 {
                std::thread::sleep(Duration::from_millis(10));
                source.emit_renamed("old.txt", "new.txt");
            }
        });
        let result = handle
            .wait_for_change(WatcherChangeTypes::RENAMED, Some(Duration::from_secs(5)))
            .unwrap();
        emitter.join().unwrap();
        assert_eq!(result.change_type, Some(WatcherChangeTypes::RENAMED));
        assert_eq!(result.old_name, Some(PathBuf::from("old.txt")));
        assert_eq!(result.name, Some(PathBuf::from("new.txt")));
    }

    #[test]
    fn test_factory_records_handles() {
        let factory = FakeHandleFactory::new();
        let settings = HandleSettings::new("/fake").with_change_reasons(ChangeReasons::SIZE);
        factory.create(&settings).unwrap();
        assert_eq!(factory.created_count(), 1);
        assert!(factory.handle_for(ChangeReasons::SIZE).is_some());

        factory.fail_next(WatchError::MissingPath);
        assert!(factory.create(&settings).is_err());
        assert_eq!(factory.created_count(), 1);
    }
}
