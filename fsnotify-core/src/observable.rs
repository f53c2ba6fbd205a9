//! Reactive projection of a dispatch core
//!
//! Every category is exposed as a [`futures::Stream`]. A stream subscribes
//! when it is created and unsubscribes when it is dropped, so the usual
//! first/last-subscriber wiring applies to streams too.

use futures::Stream;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::debug;

use crate::config::WatchOptions;
use crate::dispatch::{DispatchCore, EnhancedWatcher, HandlerId, QueueCapacity};
use crate::error::{Result, WatchError};
use crate::event::{ChangeEvent, ChangeKind};
use crate::handle::{HandleFactory, WatchHandle};

/// Unsubscribes from the core when dropped
struct Subscription {
    core: Weak<DispatchCore>,
    id: HandlerId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            if let Err(fault) = core.unsubscribe(self.id) {
                debug!("Failed to unsubscribe {}: {}", self.id, fault);
            }
        }
    }
}

/// Stream of events from one category
pub struct EventStream {
    rx: UnboundedReceiver<ChangeEvent>,
    _subscription: Subscription,
}

impl Stream for EventStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChangeEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// Stream of faults raised through the error category
pub struct ErrorStream {
    rx: UnboundedReceiver<WatchError>,
    _subscription: Subscription,
}

impl Stream for ErrorStream {
    type Item = WatchError;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<WatchError>> {
        self.rx.poll_recv(cx)
    }
}

/// Watcher whose categories are consumed as streams
pub struct ObservableWatcher {
    core: Arc<DispatchCore>,
}

impl ObservableWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::from_core(EnhancedWatcher::new(path)?.into_core()))
    }

    pub fn with_filter(path: impl Into<PathBuf>, filter: &str) -> Result<Self> {
        Ok(Self::from_core(EnhancedWatcher::with_filter(path, filter)?.into_core()))
    }

    pub fn with_handle<C>(
        handle: Box<dyn WatchHandle>,
        capacity: C,
        factory: Arc<dyn HandleFactory>,
    ) -> Result<Self>
    where
        C: TryInto<QueueCapacity>,
        C::Error: Into<WatchError>,
    {
        Ok(Self::from_core(DispatchCore::multiplexed(handle, capacity, factory)?))
    }

    pub fn from_options(options: &WatchOptions) -> Result<Self> {
        Ok(Self::from_core(EnhancedWatcher::from_options(options)?.into_core()))
    }

    pub fn from_core(core: DispatchCore) -> Self {
        Self { core: Arc::new(core) }
    }

    /// The underlying core, for configuration
    pub fn core(&self) -> &DispatchCore {
        &self.core
    }

    pub fn start(&self) -> Result<()> {
        self.core.set_raising(true)
    }

    pub fn stop(&self) -> Result<()> {
        self.core.set_raising(false)
    }

    /// Stream of one category
    pub fn events(&self, kind: ChangeKind) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.core.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
        })?;
        Ok(EventStream { rx, _subscription: self.subscription(id) })
    }

    pub fn errors(&self) -> Result<ErrorStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.core.subscribe_errors(move |fault| {
            let _ = tx.send(fault.clone());
        })?;
        Ok(ErrorStream { rx, _subscription: self.subscription(id) })
    }

    pub fn created(&self) -> Result<EventStream> {
        self.events(ChangeKind::Created)
    }

    pub fn changed(&self) -> Result<EventStream> {
        self.events(ChangeKind::Changed)
    }

    pub fn deleted(&self) -> Result<EventStream> {
        self.events(ChangeKind::Deleted)
    }

    pub fn renamed(&self) -> Result<EventStream> {
        self.events(ChangeKind::Renamed)
    }

    pub fn attribute_changed(&self) -> Result<EventStream> {
        self.events(ChangeKind::AttributeChanged)
    }

    pub fn creation_time_changed(&self) -> Result<EventStream> {
        self.events(ChangeKind::CreationTimeChanged)
    }

    pub fn last_access_changed(&self) -> Result<EventStream> {
        self.events(ChangeKind::LastAccessChanged)
    }

    pub fn last_write_changed(&self) -> Result<EventStream> {
        self.events(ChangeKind::LastWriteChanged)
    }

    pub fn security_changed(&self) -> Result<EventStream> {
        self.events(ChangeKind::SecurityChanged)
    }

    pub fn size_changed(&self) -> Result<EventStream> {
        self.events(ChangeKind::SizeChanged)
    }

    fn subscription(&self, id: HandlerId) -> Subscription {
        Subscription { core: Arc::downgrade(&self.core), id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Category;
    use crate::event::ChangeReasons;
    use crate::handle::NativeEventKind;
    use crate::testing::{FakeHandleFactory, FakeWatchHandle};
    use futures::StreamExt;
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::timeout;

    fn observable(mask: ChangeReasons) -> (ObservableWatcher, FakeWatchHandle, Arc<FakeHandleFactory>) {
        let primary = FakeWatchHandle::new("/watched");
        primary.set_change_reasons(mask).unwrap();
        let factory = FakeHandleFactory::new();
        let watcher = ObservableWatcher::with_handle(primary.boxed(), 32usize, factory.clone()).unwrap();
        (watcher, primary, factory)
    }

    #[tokio::test]
    async fn test_created_stream_yields_events() {
        let (watcher, primary, _factory) = observable(ChangeReasons::DEFAULT);
        let mut created = watcher.created().unwrap();
        watcher.start().unwrap();

        primary.emit_created("x.txt");
        let event = timeout(Duration::from_secs(2), created.next()).await.unwrap().unwrap();
        assert_eq!(event.kind(), ChangeKind::Created);
        assert_eq!(event.name(), Some(Path::new("x.txt")));
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let (watcher, primary, _factory) = observable(ChangeReasons::DEFAULT);
        let deleted = watcher.deleted().unwrap();
        assert!(primary.is_wired(NativeEventKind::Deleted));
        assert_eq!(watcher.core().handler_count(Category::Event(ChangeKind::Deleted)), 1);

        drop(deleted);
        assert!(!primary.is_wired(NativeEventKind::Deleted));
        assert_eq!(watcher.core().handler_count(Category::Event(ChangeKind::Deleted)), 0);
    }

    #[tokio::test]
    async fn test_fine_grained_stream() {
        let (watcher, _primary, factory) = observable(ChangeReasons::FILE_NAME | ChangeReasons::SIZE);
        let mut sizes = watcher.size_changed().unwrap();
        let mut errors = watcher.errors().unwrap();
        watcher.start().unwrap();

        factory.handle_for(ChangeReasons::SIZE).unwrap().emit_changed("big.bin");
        let event = timeout(Duration::from_secs(2), sizes.next()).await.unwrap().unwrap();
        assert_eq!(event.kind(), ChangeKind::SizeChanged);

        factory
            .handle_for(ChangeReasons::SIZE)
            .unwrap()
            .emit_error(WatchError::native(crate::error::NativeFaultKind::Other, "boom"));
        let fault = timeout(Duration::from_secs(2), errors.next()).await.unwrap().unwrap();
        assert!(matches!(fault, WatchError::Native { .. }));
    }

    #[tokio::test]
    async fn test_streams_end_when_watcher_is_dropped() {
        let (watcher, _primary, _factory) = observable(ChangeReasons::DEFAULT);
        let mut renamed = watcher.renamed().unwrap();
        drop(watcher);
        assert!(renamed.next().await.is_none());
    }
}
