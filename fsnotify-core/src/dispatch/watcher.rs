//! Public watcher types over [`DispatchCore`]

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use super::{DispatchCore, QueueCapacity};
use crate::config::WatchOptions;
use crate::error::{Result, WatchError};
use crate::handle::{HandleFactory, HandleSettings, NotifyHandleFactory, WatchHandle};

/// Buffered watcher over a single handle
///
/// Delivers Created, Changed, Deleted and Renamed events plus errors.
/// Fine-grained categories are rejected; use [`EnhancedWatcher`] for those.
pub struct BufferedWatcher {
    core: DispatchCore,
}

impl BufferedWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Self::from_settings(HandleSettings::new(path), QueueCapacity::DEFAULT)
    }

    pub fn with_filter(path: impl Into<PathBuf>, filter: &str) -> Result<Self> {
        Self::from_settings(HandleSettings::new(path).with_filter(filter), QueueCapacity::DEFAULT)
    }

    pub fn with_handle<C>(handle: Box<dyn WatchHandle>, capacity: C) -> Result<Self>
    where
        C: TryInto<QueueCapacity>,
        C::Error: Into<WatchError>,
    {
        Ok(Self { core: DispatchCore::new(handle, capacity)? })
    }

    pub fn from_options(options: &WatchOptions) -> Result<Self> {
        options.validate()?;
        Self::from_settings(options.handle_settings()?, options.queue_capacity()?)
    }

    fn from_settings(settings: HandleSettings, capacity: QueueCapacity) -> Result<Self> {
        let handle = NotifyHandleFactory::default().create(&settings)?;
        Self::with_handle(handle, capacity)
    }

    pub fn into_core(self) -> DispatchCore {
        self.core
    }
}

impl Deref for BufferedWatcher {
    type Target = DispatchCore;

    fn deref(&self) -> &DispatchCore {
        &self.core
    }
}

/// Buffered watcher that also reports fine-grained change categories
///
/// Keeps one extra native handle per fine-grained reason in its mask.
pub struct EnhancedWatcher {
    core: DispatchCore,
}

impl EnhancedWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Self::from_settings(HandleSettings::new(path), QueueCapacity::DEFAULT)
    }

    pub fn with_filter(path: impl Into<PathBuf>, filter: &str) -> Result<Self> {
        Self::from_settings(HandleSettings::new(path).with_filter(filter), QueueCapacity::DEFAULT)
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
        Ok(Self { core: DispatchCore::multiplexed(handle, capacity, factory)? })
    }

    pub fn from_options(options: &WatchOptions) -> Result<Self> {
        options.validate()?;
        Self::from_settings(options.handle_settings()?, options.queue_capacity()?)
    }

    pub fn from_options_with_factory(options: &WatchOptions, factory: Arc<dyn HandleFactory>) -> Result<Self> {
        options.validate()?;
        let handle = factory.create(&options.handle_settings()?)?;
        Self::with_handle(handle, options.queue_capacity()?, factory)
    }

    fn from_settings(settings: HandleSettings, capacity: QueueCapacity) -> Result<Self> {
        let factory: Arc<dyn HandleFactory> = Arc::new(NotifyHandleFactory::default());
        let handle = factory.create(&settings)?;
        Self::with_handle(handle, capacity, factory)
    }

    pub fn into_core(self) -> DispatchCore {
        self.core
    }
}

impl Deref for EnhancedWatcher {
    type Target = DispatchCore;

    fn deref(&self) -> &DispatchCore {
        &self.core
    }
}
