//! Watch handle backed by the `notify` crate

use notify::event::{AccessKind, DataChange, MetadataKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use glob_utils::NameFilter;

use super::{
    wait_on, HandleFactory, HandleSettings, ListenerSlots, NativeEvent, NativeEventKind,
    NativeListener, RawChange, WatchHandle, Waiters,
};
use crate::error::{NativeFaultKind, Result, WatchError};
use crate::event::{ChangeReasons, WaitForChangeResult, WatcherChangeTypes};
use crate::platform::PlatformCapabilities;

/// Direct binding of [`WatchHandle`] over `notify::RecommendedWatcher`
///
/// The native watcher only exists while the handle is enabled. Mask and
/// name-filter checks are applied on the notification thread before a
/// listener sees anything.
pub struct NotifyWatchHandle {
    inner: Arc<Inner>,
}

struct Inner {
    settings: RwLock<HandleSettings>,
    filter: RwLock<NameFilter>,
    canonical_root: RwLock<Option<PathBuf>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    listeners: ListenerSlots,
    waiters: Waiters,
    disposed: AtomicBool,
}

impl NotifyWatchHandle {
    /// Handle for `path` with default filter and mask
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_settings(HandleSettings::new(path))
    }

    pub fn with_settings(settings: HandleSettings) -> Result<Self> {
        if let Some(path) = &settings.path {
            check_path(path)?;
        }
        let filter = NameFilter::new(&settings.name_filter)?;
        settings.change_reasons.ensure_valid()?;

        Ok(Self {
            inner: Arc::new(Inner {
                settings: RwLock::new(HandleSettings {
                    name_filter: filter.pattern().to_string(),
                    ..settings
                }),
                filter: RwLock::new(filter),
                canonical_root: RwLock::new(None),
                watcher: Mutex::new(None),
                listeners: ListenerSlots::default(),
                waiters: Waiters::default(),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(WatchError::Disposed);
        }
        Ok(())
    }

    /// Re-register the native watch if one is running
    fn rewatch(&self) -> Result<()> {
        let mut watcher = self.inner.watcher.lock();
        if watcher.take().is_some() {
            *watcher = Some(Inner::register(&self.inner)?);
        }
        Ok(())
    }
}

impl Inner {
    fn register(this: &Arc<Inner>) -> Result<RecommendedWatcher> {
        let settings = this.settings.read().clone();
        let path = settings.path.ok_or(WatchError::MissingPath)?;

        let weak = Arc::downgrade(this);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_notify(res);
            }
        })?;

        let mode = if settings.recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
        watcher.watch(&path, mode)?;
        *this.canonical_root.write() = path.canonicalize().ok();

        info!("Watching path: {:?} (recursive: {}, reasons: {:?})", path, settings.recursive, settings.change_reasons);
        Ok(watcher)
    }

    fn on_notify(&self, res: notify::Result<Event>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        match res {
            Ok(event) => {
                trace!("Native event: {:?}", event);
                if event.need_rescan() {
                    self.emit(NativeEvent::Error(WatchError::native(
                        NativeFaultKind::Overflow,
                        "native notification buffer overflowed; a rescan is required",
                    )));
                }
                let scope = self.scope();
                for native in classify(&event, &scope) {
                    self.emit(native);
                }
            }
            Err(error) => {
                let error = WatchError::from(error);
                warn!("Watch error: {}", error);
                self.emit(NativeEvent::Error(error));
            }
        }
    }

    fn scope(&self) -> Scope {
        let settings = self.settings.read();
        Scope {
            root: settings.path.clone().unwrap_or_default(),
            canonical_root: self.canonical_root.read().clone(),
            mask: settings.change_reasons,
            filter: self.filter.read().clone(),
        }
    }

    fn emit(&self, event: NativeEvent) {
        self.waiters.notify(&event);
        self.listeners.emit(event);
    }
}

impl WatchHandle for NotifyWatchHandle {
    fn is_enabled(&self) -> bool {
        self.inner.watcher.lock().is_some()
    }

    fn set_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.ensure_live()?;
        }
        let mut watcher = self.inner.watcher.lock();
        match (enabled, watcher.is_some()) {
            (true, false) => {
                *watcher = Some(Inner::register(&self.inner)?);
            }
            (false, true) => {
                watcher.take();
                debug!("Stopped watching {:?}", self.inner.settings.read().path);
            }
            _ => {}
        }
        Ok(())
    }

    fn path(&self) -> Option<PathBuf> {
        self.inner.settings.read().path.clone()
    }

    fn set_path(&self, path: &Path) -> Result<()> {
        self.ensure_live()?;
        check_path(path)?;
        {
            let mut settings = self.inner.settings.write();
            if settings.path.as_deref() == Some(path) {
                return Ok(());
            }
            settings.path = Some(path.to_path_buf());
        }
        self.rewatch()
    }

    fn recursive(&self) -> bool {
        self.inner.settings.read().recursive
    }

    fn set_recursive(&self, recursive: bool) -> Result<()> {
        self.ensure_live()?;
        {
            let mut settings = self.inner.settings.write();
            if settings.recursive == recursive {
                return Ok(());
            }
            settings.recursive = recursive;
        }
        self.rewatch()
    }

    fn name_filter(&self) -> String {
        self.inner.settings.read().name_filter.clone()
    }

    fn set_name_filter(&self, filter: &str) -> Result<()> {
        self.ensure_live()?;
        let filter = NameFilter::new(filter)?;
        self.inner.settings.write().name_filter = filter.pattern().to_string();
        *self.inner.filter.write() = filter;
        Ok(())
    }

    fn change_reasons(&self) -> ChangeReasons {
        self.inner.settings.read().change_reasons
    }

    fn set_change_reasons(&self, reasons: ChangeReasons) -> Result<()> {
        let reasons = reasons.ensure_valid()?;
        self.ensure_live()?;
        self.inner.settings.write().change_reasons = reasons;
        Ok(())
    }

    fn set_listener(&self, kind: NativeEventKind, listener: Option<NativeListener>) {
        if self.inner.disposed.load(Ordering::Acquire) && listener.is_some() {
            return;
        }
        self.inner.listeners.set(kind, listener);
    }

    fn wait_for_change(
        &self,
        change_types: WatcherChangeTypes,
        timeout: Option<Duration>,
    ) -> Result<WaitForChangeResult> {
        wait_on(self, &self.inner.waiters, change_types, timeout)
    }

    fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.watcher.lock().take();
        self.inner.listeners.clear();
        self.inner.waiters.clear();
        debug!("Disposed watch handle for {:?}", self.inner.settings.read().path);
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl Drop for NotifyWatchHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Creates [`NotifyWatchHandle`]s
pub struct NotifyHandleFactory {
    capabilities: PlatformCapabilities,
    warned: Mutex<ChangeReasons>,
}

impl NotifyHandleFactory {
    pub fn new(capabilities: PlatformCapabilities) -> Self {
        Self { capabilities, warned: Mutex::new(ChangeReasons::empty()) }
    }

    pub fn capabilities(&self) -> &PlatformCapabilities {
        &self.capabilities
    }

    fn warn_unreported(&self, mask: ChangeReasons) {
        let unreported = self.capabilities.unreported(mask);
        let mut warned = self.warned.lock();
        let fresh = unreported.difference(*warned);
        if !fresh.is_empty() {
            warn!(
                "The {} backend never reports {:?}; handles scoped to it will stay silent",
                self.capabilities.backend, fresh
            );
            warned.insert(fresh);
        }
    }
}

impl Default for NotifyHandleFactory {
    fn default() -> Self {
        Self::new(PlatformCapabilities::detect())
    }
}

impl HandleFactory for NotifyHandleFactory {
    fn create(&self, settings: &HandleSettings) -> Result<Box<dyn WatchHandle>> {
        self.warn_unreported(settings.change_reasons);
        Ok(Box::new(NotifyWatchHandle::with_settings(settings.clone())?))
    }
}

fn check_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(WatchError::invalid_argument("watch path must not be empty"));
    }
    Ok(())
}

/// Snapshot of what a handle currently reports
struct Scope {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    mask: ChangeReasons,
    filter: NameFilter,
}

impl Scope {
    fn relative(&self, path: &Path) -> Option<PathBuf> {
        let relative = path
            .strip_prefix(&self.root)
            .ok()
            .or_else(|| self.canonical_root.as_deref().and_then(|root| path.strip_prefix(root).ok()))
            .unwrap_or(path);
        if relative.as_os_str().is_empty() { None } else { Some(relative.to_path_buf()) }
    }

    fn raw(&self, path: &Path) -> RawChange {
        RawChange::new(self.root.clone(), self.relative(path))
    }

    fn reports_names(&self) -> bool {
        self.mask.intersects(ChangeReasons::NAME_FLAGS)
    }
}

/// Change reasons carried by a non-name modification
fn reasons_of(kind: &EventKind) -> ChangeReasons {
    match kind {
        EventKind::Modify(ModifyKind::Data(DataChange::Size)) => ChangeReasons::SIZE,
        EventKind::Modify(ModifyKind::Data(DataChange::Content)) => ChangeReasons::LAST_WRITE,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            ChangeReasons::LAST_WRITE | ChangeReasons::SIZE
        }
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => ChangeReasons::LAST_ACCESS,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)) => ChangeReasons::LAST_WRITE,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions | MetadataKind::Ownership)) => {
            ChangeReasons::SECURITY
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => ChangeReasons::ATTRIBUTES,
        EventKind::Access(AccessKind::Read) => ChangeReasons::LAST_ACCESS,
        _ => ChangeReasons::empty(),
    }
}

/// Turn one `notify` event into the raw notifications a handle delivers
fn classify(event: &Event, scope: &Scope) -> Vec<NativeEvent> {
    let matching = |path: &&PathBuf| scope.filter.matches_path(path);

    match &event.kind {
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
            if !scope.reports_names() =>
        {
            Vec::new()
        }
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(matching)
            .map(|path| NativeEvent::Created(scope.raw(path)))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter(matching)
            .map(|path| NativeEvent::Deleted(scope.raw(path)))
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => classify_rename(*mode, event, scope),
        kind => {
            if !reasons_of(kind).intersects(scope.mask) {
                return Vec::new();
            }
            event
                .paths
                .iter()
                .filter(matching)
                .map(|path| NativeEvent::Changed(scope.raw(path)))
                .collect()
        }
    }
}

fn classify_rename(mode: RenameMode, event: &Event, scope: &Scope) -> Vec<NativeEvent> {
    let tracked = event.tracker().is_some();
    match (mode, event.paths.as_slice()) {
        (RenameMode::Both, [from, to, ..]) => {
            if !scope.filter.matches_path(from) && !scope.filter.matches_path(to) {
                return Vec::new();
            }
            let old_name = scope.relative(from).unwrap_or_else(|| from.clone());
            vec![NativeEvent::Renamed { change: scope.raw(to), old_name }]
        }
        // Paired halves are reported again as a single `Both` event
        (RenameMode::From | RenameMode::To, _) if tracked => Vec::new(),
        (RenameMode::From, [from, ..]) if scope.filter.matches_path(from) => {
            vec![NativeEvent::Deleted(scope.raw(from))]
        }
        (RenameMode::To, [to, ..]) if scope.filter.matches_path(to) => {
            vec![NativeEvent::Created(scope.raw(to))]
        }
        (RenameMode::Any | RenameMode::Other, paths) => paths
            .iter()
            .filter(|path| scope.filter.matches_path(path))
            .map(|path| {
                if path.exists() {
                    NativeEvent::Created(scope.raw(path))
                } else {
                    NativeEvent::Deleted(scope.raw(path))
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}
