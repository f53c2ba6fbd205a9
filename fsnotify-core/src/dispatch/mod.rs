//! Buffered dispatch core
//!
//! A [`DispatchCore`] owns a primary [`WatchHandle`] (plus, when multiplexed,
//! one satellite handle per fine-grained change reason), a bounded queue of
//! classified [`ChangeEvent`]s and a single drain task that hands queued
//! events to registered handlers.
//!
//! Notification threads never block: classification runs on whichever thread
//! the handle delivers on and the event is offered to the queue with
//! `try_send`. A full queue raises [`WatchError::BufferExhausted`] through the
//! error category instead of waiting for room.
//!
//! Handlers run one at a time on the drain task, in registration order. A slow
//! handler therefore delays every other category until it returns; event
//! handlers that block should be paired with a multi-threaded runtime.

mod capacity;
mod registry;
mod watcher;

pub use capacity::{QueueCapacity, DEFAULT_CAPACITY};
pub use registry::{Category, ErrorHandler, EventHandler, HandlerId};
pub use watcher::{BufferedWatcher, EnhancedWatcher};

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, WatchError};
use crate::event::{ChangeEvent, ChangeKind, ChangeReasons, WaitForChangeResult, WatcherChangeTypes};
use crate::handle::{HandleFactory, NativeEvent, NativeEventKind, NativeListener, WatchHandle};
use crate::multiplexer::FilterHandleTable;
use registry::HandlerRegistry;

/// Counters describing the traffic through one core
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub dispatched: u64,
    pub overflowed: u64,
    pub handler_faults: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    overflowed: AtomicU64,
    handler_faults: AtomicU64,
}

/// State reachable from notification threads and the drain task
pub(crate) struct Shared {
    registry: RwLock<HandlerRegistry>,
    queue: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
    capacity: QueueCapacity,
    counters: Counters,
}

impl Shared {
    fn new(capacity: QueueCapacity) -> Self {
        Self {
            registry: RwLock::new(HandlerRegistry::default()),
            queue: Mutex::new(None),
            capacity,
            counters: Counters::default(),
        }
    }

    /// Listener feeding the queue; `Changed` notifications are filed under `changed_as`
    pub(crate) fn listener(self: &Arc<Self>, changed_as: ChangeKind) -> NativeListener {
        let shared = Arc::downgrade(self);
        Arc::new(move |native| {
            if let Some(shared) = shared.upgrade() {
                shared.on_native(changed_as, native);
            }
        })
    }

    pub(crate) fn has_handlers(&self, kind: ChangeKind) -> bool {
        self.registry.read().has_handlers(kind)
    }

    fn on_native(&self, changed_as: ChangeKind, native: NativeEvent) {
        let event = match native {
            NativeEvent::Created(raw) => ChangeEvent::new(ChangeKind::Created, raw.directory, raw.name),
            NativeEvent::Changed(raw) => ChangeEvent::new(changed_as, raw.directory, raw.name),
            NativeEvent::Deleted(raw) => ChangeEvent::new(ChangeKind::Deleted, raw.directory, raw.name),
            NativeEvent::Renamed { change, old_name } => {
                Ok(ChangeEvent::renamed(change.directory, old_name, change.name))
            }
            NativeEvent::Error(fault) => {
                warn!("Native watch fault: {}", fault);
                return self.raise_error(&fault);
            }
        };

        match event {
            Ok(event) => self.enqueue(event),
            Err(fault) => error!("Dropping unclassifiable notification: {}", fault),
        }
    }

    fn enqueue(&self, event: ChangeEvent) {
        let outcome = match self.queue.lock().as_ref() {
            Some(tx) => tx.try_send(event),
            None => {
                trace!("Not raising, dropping {:?} event", event.kind());
                return;
            }
        };

        match outcome {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                let fault = WatchError::buffer_exhausted(self.capacity.get());
                warn!("{} Dropped {:?} event for {:?}", fault, event.kind(), event.full_path());
                self.raise_error(&fault);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Queue closed, dropping event");
            }
        }
    }

    /// Deliver a fault to every error handler on the calling thread
    pub(crate) fn raise_error(&self, fault: &WatchError) {
        let handlers = self.registry.read().error_handlers();
        if handlers.is_empty() {
            warn!("Unobserved watch error: {}", fault);
            return;
        }
        for handler in handlers {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(fault))) {
                error!(
                    "Error handler panicked: {} (while handling: {})",
                    panic_message(panic.as_ref()),
                    fault
                );
            }
        }
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let kind = event.kind();
        let handlers = self.registry.read().event_handlers(kind);
        for handler in handlers {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                self.counters.handler_faults.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(panic.as_ref());
                error!("Handler for {:?} events panicked: {}", kind, message);
                self.raise_error(&WatchError::HandlerPanicked { category: kind, message });
            }
        }
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Single consumer of the queue; cancellation is checked before every read
async fn drain(shared: Arc<Shared>, mut rx: mpsc::Receiver<ChangeEvent>, token: CancellationToken) {
    debug!("Drain loop started");
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        shared.dispatch(&event);
    }
    debug!("Drain loop stopped");
}

struct CoreState {
    raising: bool,
    disposed: bool,
    token: Option<CancellationToken>,
    satellites: Option<FilterHandleTable>,
    /// Blocking waits in progress; they keep the primary enabled
    waits: usize,
}

impl CoreState {
    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(WatchError::Disposed);
        }
        Ok(())
    }
}

/// Bounded, backpressure-aware event pipeline over one or more watch handles
///
/// Configuration changes, (un)subscription and raising transitions are
/// serialized by one mutex, so mask reassignment never races the
/// fine-grained handle reconciliation.
pub struct DispatchCore {
    primary: Box<dyn WatchHandle>,
    shared: Arc<Shared>,
    state: Mutex<CoreState>,
}

impl DispatchCore {
    /// Core over a single handle
    ///
    /// The capacity is validated before the handle is touched.
    pub fn new<C>(handle: Box<dyn WatchHandle>, capacity: C) -> Result<Self>
    where
        C: TryInto<QueueCapacity>,
        C::Error: Into<WatchError>,
    {
        let capacity = capacity.try_into().map_err(Into::into)?;
        let shared = Arc::new(Shared::new(capacity));
        handle.set_listener(NativeEventKind::Error, Some(shared.listener(ChangeKind::Changed)));

        Ok(Self {
            primary: handle,
            shared,
            state: Mutex::new(CoreState {
                raising: false,
                disposed: false,
                token: None,
                satellites: None,
                waits: 0,
            }),
        })
    }

    /// Core that also provisions one satellite handle per fine-grained reason in the mask
    pub fn multiplexed<C>(
        handle: Box<dyn WatchHandle>,
        capacity: C,
        factory: Arc<dyn HandleFactory>,
    ) -> Result<Self>
    where
        C: TryInto<QueueCapacity>,
        C::Error: Into<WatchError>,
    {
        let core = Self::new(handle, capacity)?;
        {
            let mut state = core.state.lock();
            let mut table = FilterHandleTable::new(factory);
            let result = table.reconcile(
                core.primary.change_reasons(),
                &core.primary.settings(),
                false,
                &core.shared,
            );
            state.satellites = Some(table);
            result?;
        }
        Ok(core)
    }

    pub fn is_multiplexed(&self) -> bool {
        self.state.lock().satellites.is_some()
    }

    pub fn capacity(&self) -> QueueCapacity {
        self.shared.capacity
    }

    pub fn stats(&self) -> DispatchStats {
        let counters = &self.shared.counters;
        DispatchStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            overflowed: counters.overflowed.load(Ordering::Relaxed),
            handler_faults: counters.handler_faults.load(Ordering::Relaxed),
        }
    }

    pub fn is_raising(&self) -> bool {
        self.state.lock().raising
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Start or stop raising events
    ///
    /// Starting requires a tokio runtime; it enables every handle and spawns
    /// the drain task. Stopping disables the handles and cancels the drain
    /// task; events still queued are discarded.
    pub fn set_raising(&self, raising: bool) -> Result<()> {
        let mut state = self.state.lock();
        if raising {
            state.ensure_live()?;
            if !state.raising {
                self.start(&mut state)?;
            }
        } else if state.raising {
            self.stop(&mut state);
        }
        Ok(())
    }

    fn start(&self, state: &mut CoreState) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchError::RuntimeUnavailable)?;

        let (tx, rx) = mpsc::channel(self.shared.capacity.get());
        *self.shared.queue.lock() = Some(tx);

        if let Err(fault) = self.enable_handles(state, true) {
            *self.shared.queue.lock() = None;
            if let Err(rollback) = self.enable_handles(state, false) {
                warn!("Failed to disable handles after a failed start: {}", rollback);
            }
            return Err(fault);
        }

        let token = CancellationToken::new();
        runtime.spawn(drain(self.shared.clone(), rx, token.clone()));
        state.token = Some(token);
        state.raising = true;

        info!(
            "Raising events for {:?} (capacity {}, satellites {:?})",
            self.primary.path(),
            self.shared.capacity,
            state.satellites.as_ref().map(FilterHandleTable::flags).unwrap_or_default()
        );
        Ok(())
    }

    fn stop(&self, state: &mut CoreState) {
        if let Some(token) = state.token.take() {
            token.cancel();
        }
        *self.shared.queue.lock() = None;
        if let Err(fault) = self.enable_handles(state, false) {
            warn!("Failed to disable watch handles: {}", fault);
        }
        state.raising = false;
        info!("Stopped raising events for {:?}", self.primary.path());
    }

    fn enable_handles(&self, state: &CoreState, enabled: bool) -> Result<()> {
        if enabled || state.waits == 0 {
            self.primary.set_enabled(enabled)?;
        }
        if let Some(table) = &state.satellites {
            table.set_enabled(enabled)?;
        }
        Ok(())
    }

    /// Register a handler for one event category
    ///
    /// The first handler of a category wires the matching native listener.
    /// Fine-grained categories need a multiplexed core; subscribing to a reason
    /// that is not in the mask is accepted and takes effect once it is.
    pub fn subscribe<F>(&self, kind: ChangeKind, handler: F) -> Result<HandlerId>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let state = self.state.lock();
        state.ensure_live()?;
        if kind.is_fine_grained() && state.satellites.is_none() {
            return Err(WatchError::invalid_argument(format!(
                "{kind:?} events require a multiplexed watcher"
            )));
        }

        let (id, transition) = self.shared.registry.write().add_event(kind, Arc::new(handler));
        if transition.edge {
            self.wire(&state, kind, true);
        }
        debug!("Subscribed {} to {:?} events", id, kind);
        Ok(id)
    }

    /// Register a handler for native faults, overflow and handler panics
    pub fn subscribe_errors<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&WatchError) + Send + Sync + 'static,
    {
        let state = self.state.lock();
        state.ensure_live()?;
        let (id, _) = self.shared.registry.write().add_error(Arc::new(handler));
        debug!("Subscribed {} to errors", id);
        Ok(id)
    }

    /// Remove a registration; returns whether it existed
    pub fn unsubscribe(&self, id: HandlerId) -> Result<bool> {
        let state = self.state.lock();
        if state.disposed {
            return Ok(false);
        }
        let transition = self.shared.registry.write().remove(id);
        match transition {
            Some(transition) => {
                if let (Category::Event(kind), true) = (transition.category, transition.edge) {
                    self.wire(&state, kind, false);
                }
                debug!("Unsubscribed {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn handler_count(&self, category: Category) -> usize {
        self.shared.registry.read().count(category)
    }

    fn wire(&self, state: &CoreState, kind: ChangeKind, wired: bool) {
        let route = if kind.is_fine_grained() { kind } else { ChangeKind::Changed };
        let listener = wired.then(|| self.shared.listener(route));
        match native_slot(kind) {
            Some(slot) => self.primary.set_listener(slot, listener),
            None => {
                if let Some(table) = &state.satellites {
                    table.wire(kind, listener);
                }
            }
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.primary.path()
    }

    pub fn set_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let state = self.state.lock();
        state.ensure_live()?;
        self.primary.set_path(path.as_ref())?;
        self.propagate(&state)
    }

    pub fn recursive(&self) -> bool {
        self.primary.recursive()
    }

    pub fn set_recursive(&self, recursive: bool) -> Result<()> {
        let state = self.state.lock();
        state.ensure_live()?;
        self.primary.set_recursive(recursive)?;
        self.propagate(&state)
    }

    pub fn name_filter(&self) -> String {
        self.primary.name_filter()
    }

    pub fn set_name_filter(&self, filter: &str) -> Result<()> {
        let state = self.state.lock();
        state.ensure_live()?;
        self.primary.set_name_filter(filter)?;
        self.propagate(&state)
    }

    pub fn change_reasons(&self) -> ChangeReasons {
        self.primary.change_reasons()
    }

    /// Reassign the mask, reconciling satellite handles when multiplexed
    ///
    /// Allowed while raising; satellites provisioned then start enabled.
    pub fn set_change_reasons(&self, reasons: ChangeReasons) -> Result<()> {
        let reasons = reasons.ensure_valid()?;
        let mut state = self.state.lock();
        state.ensure_live()?;
        self.primary.set_change_reasons(reasons)?;

        let settings = self.primary.settings();
        let raising = state.raising;
        if let Some(table) = state.satellites.as_mut() {
            table.reconcile(reasons, &settings, raising, &self.shared)?;
        }
        Ok(())
    }

    /// Fine-grained reasons that currently have a satellite handle
    pub fn satellite_reasons(&self) -> ChangeReasons {
        self.state.lock().satellites.as_ref().map(FilterHandleTable::flags).unwrap_or_default()
    }

    fn propagate(&self, state: &CoreState) -> Result<()> {
        match &state.satellites {
            Some(table) => table.apply_settings(&self.primary.settings()),
            None => Ok(()),
        }
    }

    /// Block until the primary handle sees a matching change
    ///
    /// A stopped core enables its primary for the duration of the wait. The
    /// primary is only disabled again once the last wait returns and the core
    /// is still not raising.
    pub fn wait_for_change(&self, change_types: WatcherChangeTypes) -> Result<WaitForChangeResult> {
        self.wait(change_types, None)
    }

    pub fn wait_for_change_timeout(
        &self,
        change_types: WatcherChangeTypes,
        timeout: Duration,
    ) -> Result<WaitForChangeResult> {
        self.wait(change_types, Some(timeout))
    }

    fn wait(&self, change_types: WatcherChangeTypes, timeout: Option<Duration>) -> Result<WaitForChangeResult> {
        let change_types = change_types.validate()?;
        {
            let mut state = self.state.lock();
            state.ensure_live()?;
            if !state.raising {
                self.primary.set_enabled(true)?;
            }
            state.waits += 1;
        }

        // The primary is already enabled, so the handle never toggles it itself
        let outcome = self.primary.wait_for_change(change_types, timeout);

        let mut state = self.state.lock();
        state.waits -= 1;
        if state.waits == 0 && !state.raising && !state.disposed {
            if let Err(fault) = self.primary.set_enabled(false) {
                warn!("Failed to disable watch handle after a wait: {}", fault);
            }
        }
        outcome
    }

    /// Stop raising, release every handle and clear all registrations
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        if state.raising {
            self.stop(&mut state);
        }
        state.disposed = true;
        if let Some(mut table) = state.satellites.take() {
            table.dispose_all();
        }
        self.primary.dispose();
        self.shared.registry.write().clear();
        debug!("Dispatch core for {:?} disposed", self.primary.path());
    }
}

impl Drop for DispatchCore {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn native_slot(kind: ChangeKind) -> Option<NativeEventKind> {
    match kind {
        ChangeKind::Created => Some(NativeEventKind::Created),
        ChangeKind::Changed => Some(NativeEventKind::Changed),
        ChangeKind::Deleted => Some(NativeEventKind::Deleted),
        ChangeKind::Renamed => Some(NativeEventKind::Renamed),
        _ => None,
    }
}
