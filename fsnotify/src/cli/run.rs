use anyhow::Result;
use futures::StreamExt;
use fsnotify_core::{
    ChangeEvent, ChannelWatcher, EnhancedWatcher, ObservableWatcher, WatchError, WatchOptions,
};
use tracing::{info, warn};

use super::app::Mode;

/// Watch until Ctrl-C, consuming events in the requested style
pub async fn execute(mode: Mode, options: WatchOptions) -> Result<()> {
    match mode {
        Mode::Callback => run_callbacks(options).await,
        Mode::Channel => run_channels(options).await,
        Mode::Stream => run_streams(options).await,
    }
}

async fn run_callbacks(options: WatchOptions) -> Result<()> {
    let watcher = EnhancedWatcher::from_options(&options)?;
    for kind in options.categories()? {
        watcher.subscribe(kind, print_event)?;
    }
    watcher.subscribe_errors(print_error)?;

    watcher.set_raising(true)?;
    info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    watcher.set_raising(false)?;

    let stats = watcher.stats();
    info!(
        "Dispatched {} events ({} overflowed, {} handler faults)",
        stats.dispatched, stats.overflowed, stats.handler_faults
    );
    Ok(())
}

async fn run_channels(options: WatchOptions) -> Result<()> {
    let (watcher, mut channels) = ChannelWatcher::new(options)?;
    watcher.start()?;
    info!("Press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = channels.events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            Some(fault) = channels.errors.recv() => print_error(&fault),
        }
    }

    watcher.stop()?;
    Ok(())
}

async fn run_streams(options: WatchOptions) -> Result<()> {
    let watcher = ObservableWatcher::from_options(&options)?;
    let streams = options.categories()?
        .into_iter()
        .map(|kind| watcher.events(kind))
        .collect::<fsnotify_core::Result<Vec<_>>>()?;
    let mut events = futures::stream::select_all(streams);
    let mut errors = watcher.errors()?;

    watcher.start()?;
    info!("Press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = events.next() => print_event(&event),
            Some(fault) = errors.next() => print_error(&fault),
        }
    }

    watcher.stop()?;
    Ok(())
}

fn print_event(event: &ChangeEvent) {
    match event.old_full_path() {
        Some(old) => println!("{:?}: {} -> {}", event.kind(), old.display(), event.full_path().display()),
        None => println!("{:?}: {}", event.kind(), event.full_path().display()),
    }
}

fn print_error(fault: &WatchError) {
    warn!("{}", fault);
    if let Some(capacity) = fault.capacity() {
        println!("Buffer exhausted (capacity {capacity})");
    }
}
