//! Channel-based consumption adapter
//!
//! [`ChannelWatcher`] republishes a multiplexed core's output on two bounded
//! tokio channels: one for change events and one for faults. The adapter is
//! one-shot. Once stopped, both channels are complete and the instance can
//! never be started again.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::config::WatchOptions;
use crate::dispatch::DispatchCore;
use crate::error::{Result, WatchError};
use crate::event::{ChangeEvent, ChangeReasons};
use crate::handle::{HandleFactory, NotifyHandleFactory};

/// Options accepted by [`ChannelWatcher`]
pub type ChannelWatcherOptions = WatchOptions;

/// Lifecycle of a [`ChannelWatcher`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Started,
    Stopped,
}

/// Receiving ends handed out by [`ChannelWatcher::new`]
#[derive(Debug)]
pub struct WatchChannels {
    pub events: mpsc::Receiver<ChangeEvent>,
    pub errors: mpsc::Receiver<WatchError>,
}

struct Senders {
    events: mpsc::Sender<ChangeEvent>,
    errors: mpsc::Sender<WatchError>,
}

/// Publishing side; dropping the senders completes both channels
struct Publisher {
    senders: Mutex<Option<Senders>>,
    event_capacity: usize,
}

impl Publisher {
    fn publish_event(&self, event: &ChangeEvent) {
        let outcome = match self.senders.lock().as_ref() {
            Some(senders) => senders.events.try_send(event.clone()),
            None => return,
        };
        match outcome {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?} event for {:?}", event.kind(), event.full_path());
                self.publish_error(&WatchError::buffer_exhausted(self.event_capacity));
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event receiver dropped");
            }
        }
    }

    fn publish_error(&self, fault: &WatchError) {
        let outcome = match self.senders.lock().as_ref() {
            Some(senders) => senders.errors.try_send(fault.clone()),
            None => return,
        };
        match outcome {
            Ok(()) => {}
            Err(TrySendError::Full(fault)) => warn!("Error channel full, dropping fault: {}", fault),
            Err(TrySendError::Closed(fault)) => warn!("Watch error with no error reader: {}", fault),
        }
    }

    fn complete(&self) {
        self.senders.lock().take();
    }
}

/// Pull-style watcher publishing onto an event channel and an error channel
pub struct ChannelWatcher {
    core: DispatchCore,
    options: WatchOptions,
    publisher: Arc<Publisher>,
    state: Mutex<ChannelState>,
}

impl ChannelWatcher {
    /// Build over the native backend
    pub fn new(options: ChannelWatcherOptions) -> Result<(Self, WatchChannels)> {
        Self::with_factory(options, Arc::new(NotifyHandleFactory::default()))
    }

    /// Build with a custom handle factory (used for the primary and every satellite)
    pub fn with_factory(
        options: ChannelWatcherOptions,
        factory: Arc<dyn HandleFactory>,
    ) -> Result<(Self, WatchChannels)> {
        options.validate()?;
        let handle = factory.create(&options.handle_settings()?)?;
        let core = DispatchCore::multiplexed(handle, options.queue_capacity()?, factory)?;

        let (event_tx, events) = mpsc::channel(options.event_channel_capacity);
        let (error_tx, errors) = mpsc::channel(options.error_channel_capacity);
        let publisher = Arc::new(Publisher {
            senders: Mutex::new(Some(Senders { events: event_tx, errors: error_tx })),
            event_capacity: options.event_channel_capacity,
        });

        let watcher = Self { core, options, publisher, state: Mutex::new(ChannelState::Created) };
        watcher.subscribe_categories()?;
        Ok((watcher, WatchChannels { events, errors }))
    }

    fn subscribe_categories(&self) -> Result<()> {
        for kind in self.options.categories()? {
            let publisher = self.publisher.clone();
            self.core.subscribe(kind, move |event| publisher.publish_event(event))?;
        }
        let publisher = self.publisher.clone();
        self.core.subscribe_errors(move |fault| publisher.publish_error(fault))?;
        Ok(())
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn options(&self) -> &ChannelWatcherOptions {
        &self.options
    }

    /// Apply the held configuration and start raising
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ChannelState::Stopped => return Err(WatchError::AlreadyCompleted),
            ChannelState::Started => return Ok(()),
            ChannelState::Created => {}
        }

        self.core.set_path(&self.options.path)?;
        self.core.set_recursive(self.options.recursive)?;
        self.core.set_name_filter(&self.options.name_filter)?;
        self.core.set_change_reasons(self.options.reasons()?)?;
        self.core.set_raising(true)?;

        *state = ChannelState::Started;
        info!("Channel watcher started on {:?}", self.options.path);
        Ok(())
    }

    /// Stop raising and complete both channels; the instance cannot restart
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == ChannelState::Stopped {
            return Ok(());
        }
        let stopped = self.core.set_raising(false);
        self.publisher.complete();
        *state = ChannelState::Stopped;
        info!("Channel watcher stopped on {:?}", self.options.path);
        stopped
    }

    /// Mask actually in effect on the underlying core
    pub fn change_reasons(&self) -> ChangeReasons {
        self.core.change_reasons()
    }
}

impl Drop for ChannelWatcher {
    fn drop(&mut self) {
        self.publisher.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NativeFaultKind;
    use crate::event::ChangeKind;
    use crate::testing::{FakeHandleFactory, FakeWatchHandle};
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn fake_watcher(options: WatchOptions) -> (ChannelWatcher, WatchChannels, Arc<FakeHandleFactory>) {
        let factory = FakeHandleFactory::new();
        let (watcher, channels) = ChannelWatcher::with_factory(options, factory.clone()).unwrap();
        (watcher, channels, factory)
    }

    fn primary(factory: &FakeHandleFactory) -> FakeWatchHandle {
        factory.handles().remove(0)
    }

    #[tokio::test]
    async fn test_only_enabled_categories_are_published() {
        let options = WatchOptions::new("/watched").with_enabled(&[ChangeKind::Created]);
        let (watcher, mut channels, factory) = fake_watcher(options);
        watcher.start().unwrap();
        let handle = primary(&factory);

        handle.emit_created("new.txt");
        handle.emit_changed("new.txt");
        handle.emit_deleted("old.txt");
        handle.emit_renamed("a.txt", "b.txt");
        if let Some(last_write) = factory.handle_for(ChangeReasons::LAST_WRITE) {
            last_write.emit_changed("new.txt");
        }

        let event = timeout(Duration::from_secs(2), channels.events.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind(), ChangeKind::Created);
        assert_eq!(event.name(), Some(Path::new("new.txt")));

        sleep(Duration::from_millis(100)).await;
        assert!(channels.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_stop_is_one_shot() {
        let (watcher, mut channels, _factory) = fake_watcher(WatchOptions::new("/watched"));
        assert_eq!(watcher.state(), ChannelState::Created);
        watcher.start().unwrap();
        assert_eq!(watcher.state(), ChannelState::Started);
        watcher.stop().unwrap();
        assert_eq!(watcher.state(), ChannelState::Stopped);
        assert_eq!(watcher.start(), Err(WatchError::AlreadyCompleted));

        // Both channels observe end-of-stream
        assert_eq!(channels.events.recv().await, None);
        assert_eq!(channels.errors.recv().await, None);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_terminal() {
        let (watcher, _channels, _factory) = fake_watcher(WatchOptions::new("/watched"));
        watcher.stop().unwrap();
        assert!(watcher.start().unwrap_err().is_lifecycle_fault());
    }

    #[tokio::test]
    async fn test_rename_payload() {
        let (watcher, mut channels, factory) = fake_watcher(WatchOptions::new("/watched"));
        watcher.start().unwrap();
        primary(&factory).emit_renamed("a.txt", "b.txt");

        let event = timeout(Duration::from_secs(2), channels.events.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind(), ChangeKind::Renamed);
        assert_eq!(event.old_name(), Some(Path::new("a.txt")));
        assert_eq!(event.old_full_path(), Some(Path::new("/watched/a.txt").to_path_buf()));
        assert_eq!(event.name(), Some(Path::new("b.txt")));
        assert_eq!(event.full_path(), Path::new("/watched/b.txt"));
    }

    #[tokio::test]
    async fn test_changes_published_under_fine_grained_categories() {
        let options = WatchOptions::new("/watched")
            .with_change_reasons(ChangeReasons::FILE_NAME | ChangeReasons::SIZE);
        let (watcher, mut channels, factory) = fake_watcher(options);
        watcher.start().unwrap();

        // Generic changes from the primary are not republished when a fine-grained flag is set
        primary(&factory).emit_changed("data.bin");
        factory.handle_for(ChangeReasons::SIZE).unwrap().emit_changed("data.bin");

        let event = timeout(Duration::from_secs(2), channels.events.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind(), ChangeKind::SizeChanged);
        sleep(Duration::from_millis(50)).await;
        assert!(channels.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_errors_use_their_own_channel() {
        let (watcher, mut channels, factory) = fake_watcher(WatchOptions::new("/watched"));
        watcher.start().unwrap();
        primary(&factory).emit_error(WatchError::native(NativeFaultKind::Overflow, "rescan"));

        let fault = timeout(Duration::from_secs(2), channels.errors.recv()).await.unwrap().unwrap();
        assert!(matches!(fault, WatchError::Native { kind: NativeFaultKind::Overflow, .. }));
        assert!(channels.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_event_channel_reports_on_error_channel() {
        let mut options = WatchOptions::new("/watched");
        options.event_channel_capacity = 1;
        let (watcher, mut channels, factory) = fake_watcher(options);
        watcher.start().unwrap();

        let handle = primary(&factory);
        handle.emit_created("1");
        handle.emit_created("2");

        let fault = timeout(Duration::from_secs(2), channels.errors.recv()).await.unwrap().unwrap();
        assert!(fault.is_buffer_exhausted());
        assert_eq!(fault.capacity(), Some(1));
        assert_eq!(channels.events.recv().await.unwrap().name(), Some(Path::new("1")));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let factory = FakeHandleFactory::new();
        let options = WatchOptions::new("/watched").with_capacity(0);
        assert!(ChannelWatcher::with_factory(options, factory.clone()).is_err());
        assert_eq!(factory.created_count(), 0);
    }
}
