//! Buffered filesystem change notification
//!
//! This crate wraps the native directory-watch facility (through `notify`)
//! and layers three things on top of it:
//! - a bounded event queue drained by a single task, so slow handlers never
//!   make native notifications vanish silently
//! - fine-grained change categories (size, attributes, timestamps, security),
//!   obtained by keeping one extra native handle per reason
//! - three ways to consume the same stream: handler subscription, a pair of
//!   bounded channels, and per-category `Stream`s

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handle;
mod multiplexer;
pub mod observable;
pub mod platform;
pub mod testing;

pub use channel::{ChannelState, ChannelWatcher, ChannelWatcherOptions, WatchChannels};
pub use config::WatchOptions;
pub use dispatch::{
    BufferedWatcher, Category, DispatchCore, DispatchStats, EnhancedWatcher, HandlerId, QueueCapacity,
    DEFAULT_CAPACITY,
};
pub use error::{NativeFaultKind, Result, WatchError};
pub use event::{ChangeEvent, ChangeKind, ChangeReasons, WaitForChangeResult, WatcherChangeTypes};
pub use handle::{
    HandleFactory, HandleSettings, NativeEvent, NativeEventKind, NativeListener, NotifyHandleFactory,
    NotifyWatchHandle, RawChange, WatchHandle,
};
pub use observable::{ErrorStream, EventStream, ObservableWatcher};
pub use platform::PlatformCapabilities;
