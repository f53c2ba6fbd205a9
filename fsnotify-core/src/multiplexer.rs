//! Fine-grained multiplexer
//!
//! The native facility reports at most one generic "changed" notification per
//! configured mask, so it cannot say which attribute changed. A multiplexed
//! core keeps one satellite handle per fine-grained reason in its mask, each
//! scoped to exactly that reason, and files the satellite's Changed
//! notifications under the matching fine-grained category.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::dispatch::Shared;
use crate::error::Result;
use crate::event::{ChangeKind, ChangeReasons};
use crate::handle::{HandleFactory, HandleSettings, NativeEventKind, NativeListener, WatchHandle};

/// Satellite handle isolating one reason
struct SatelliteHandle {
    kind: ChangeKind,
    handle: Box<dyn WatchHandle>,
}

/// Single-flag reason to satellite handle, reconciled on every mask change
pub(crate) struct FilterHandleTable {
    factory: Arc<dyn HandleFactory>,
    entries: BTreeMap<ChangeReasons, SatelliteHandle>,
}

impl FilterHandleTable {
    pub fn new(factory: Arc<dyn HandleFactory>) -> Self {
        Self { factory, entries: BTreeMap::new() }
    }

    /// Union of the reasons that currently have a satellite
    pub fn flags(&self) -> ChangeReasons {
        self.entries.keys().copied().collect()
    }

    /// Make the key set equal the fine-grained flags of `mask`
    ///
    /// Stale satellites are disposed first. New ones are scoped to `settings`
    /// narrowed to their flag, wired if their category already has
    /// subscribers, and enabled when `raising`. A creation failure returns
    /// immediately and leaves earlier satellites in place.
    pub fn reconcile(
        &mut self,
        mask: ChangeReasons,
        settings: &HandleSettings,
        raising: bool,
        shared: &Arc<Shared>,
    ) -> Result<()> {
        let wanted = mask.fine_grained();
        let existing = self.flags();

        for flag in existing.difference(wanted).iter() {
            if let Some(satellite) = self.entries.remove(&flag) {
                satellite.handle.dispose();
                debug!("Released {:?} satellite handle", satellite.kind);
            }
        }

        for flag in wanted.difference(existing).iter() {
            let Some(kind) = ChangeKind::for_reason(flag) else {
                continue;
            };
            let handle = self.factory.create(&settings.scoped_to(flag))?;
            handle.set_listener(NativeEventKind::Error, Some(shared.listener(kind)));
            if shared.has_handlers(kind) {
                handle.set_listener(NativeEventKind::Changed, Some(shared.listener(kind)));
            }
            if raising {
                if let Err(fault) = handle.set_enabled(true) {
                    handle.dispose();
                    return Err(fault);
                }
            }
            debug!("Provisioned {:?} satellite handle", kind);
            self.entries.insert(flag, SatelliteHandle { kind, handle });
        }

        Ok(())
    }

    /// Wire or unwire the Changed listener of the satellite for `kind`, if provisioned
    pub fn wire(&self, kind: ChangeKind, listener: Option<NativeListener>) {
        let Some(flag) = kind.reason() else {
            return;
        };
        if let Some(satellite) = self.entries.get(&flag) {
            satellite.handle.set_listener(NativeEventKind::Changed, listener);
        }
    }

    /// Enable or disable every satellite; the first failure is returned after all were tried
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let mut first_fault = None;
        for satellite in self.entries.values() {
            if let Err(fault) = satellite.handle.set_enabled(enabled) {
                warn!("Failed to toggle {:?} satellite handle: {}", satellite.kind, fault);
                first_fault.get_or_insert(fault);
            }
        }
        first_fault.map_or(Ok(()), Err)
    }

    /// Push path, recursion and filter onto every satellite, keeping each one's own flag
    pub fn apply_settings(&self, settings: &HandleSettings) -> Result<()> {
        for (flag, satellite) in &self.entries {
            satellite.handle.apply_settings(&settings.scoped_to(*flag))?;
        }
        Ok(())
    }

    pub fn dispose_all(&mut self) {
        for (_, satellite) in std::mem::take(&mut self.entries) {
            satellite.handle.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::dispatch::DispatchCore;
    use crate::error::WatchError;
    use crate::event::{ChangeKind, ChangeReasons};
    use crate::handle::{NativeEventKind, WatchHandle};
    use crate::testing::{FakeHandleFactory, FakeWatchHandle};
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::{sleep, timeout};

    fn multiplexed(mask: ChangeReasons) -> (DispatchCore, FakeWatchHandle, std::sync::Arc<FakeHandleFactory>) {
        let primary = FakeWatchHandle::new("/watched");
        primary.set_change_reasons(mask).unwrap();
        let factory = FakeHandleFactory::new();
        let core = DispatchCore::multiplexed(primary.boxed(), 64usize, factory.clone()).unwrap();
        (core, primary, factory)
    }

    #[test]
    fn test_initial_mask_is_reconciled_at_construction() {
        let (core, _primary, factory) = multiplexed(ChangeReasons::DEFAULT);
        assert_eq!(core.satellite_reasons(), ChangeReasons::LAST_WRITE);
        assert_eq!(factory.created_count(), 1);
        let satellite = factory.handle_for(ChangeReasons::LAST_WRITE).unwrap();
        assert_eq!(satellite.path(), Some("/watched".into()));
    }

    #[test]
    fn test_mask_change_adds_and_removes_satellites() {
        let (core, _primary, factory) = multiplexed(ChangeReasons::DEFAULT);
        let last_write = factory.handle_for(ChangeReasons::LAST_WRITE).unwrap();

        core.set_change_reasons(ChangeReasons::SIZE | ChangeReasons::ATTRIBUTES | ChangeReasons::FILE_NAME)
            .unwrap();
        assert_eq!(core.satellite_reasons(), ChangeReasons::SIZE | ChangeReasons::ATTRIBUTES);
        assert_eq!(last_write.dispose_count(), 1);
        assert!(factory.handle_for(ChangeReasons::SIZE).is_some());
        assert!(factory.handle_for(ChangeReasons::ATTRIBUTES).is_some());

        // Name flags never get a satellite of their own
        core.set_change_reasons(ChangeReasons::NAME_FLAGS).unwrap();
        assert_eq!(core.satellite_reasons(), ChangeReasons::empty());
        assert_eq!(factory.created_count(), 3);
    }

    #[test]
    fn test_failed_provisioning_keeps_earlier_satellites() {
        let (core, _primary, factory) = multiplexed(ChangeReasons::ATTRIBUTES);
        let attributes = factory.handle_for(ChangeReasons::ATTRIBUTES).unwrap();

        factory.fail_next(WatchError::MissingPath);
        let result = core.set_change_reasons(
            ChangeReasons::ATTRIBUTES | ChangeReasons::SIZE | ChangeReasons::LAST_WRITE,
        );
        assert_eq!(result, Err(WatchError::MissingPath));
        assert!(core.satellite_reasons().contains(ChangeReasons::ATTRIBUTES));
        assert!(!attributes.is_disposed());

        core.dispose();
        assert_eq!(attributes.dispose_count(), 1);
        for handle in factory.handles() {
            assert!(handle.is_disposed());
        }
    }

    #[test]
    fn test_settings_propagate_to_satellites() {
        let (core, _primary, factory) = multiplexed(ChangeReasons::SIZE | ChangeReasons::SECURITY);
        core.set_path("/elsewhere").unwrap();
        core.set_name_filter("*.log").unwrap();
        core.set_recursive(true).unwrap();

        for reason in [ChangeReasons::SIZE, ChangeReasons::SECURITY] {
            let satellite = factory.handle_for(reason).unwrap();
            assert_eq!(satellite.path(), Some("/elsewhere".into()));
            assert_eq!(satellite.name_filter(), "*.log");
            assert!(satellite.recursive());
            assert_eq!(satellite.change_reasons(), reason);
        }
    }

    #[test]
    fn test_satellite_wiring_follows_subscribers() {
        let (core, _primary, factory) = multiplexed(ChangeReasons::SIZE);
        let size = factory.handle_for(ChangeReasons::SIZE).unwrap();
        assert!(!size.is_wired(NativeEventKind::Changed));
        assert!(size.is_wired(NativeEventKind::Error));

        let id = core.subscribe(ChangeKind::SizeChanged, |_| {}).unwrap();
        assert!(size.is_wired(NativeEventKind::Changed));
        core.unsubscribe(id).unwrap();
        assert!(!size.is_wired(NativeEventKind::Changed));
    }

    #[test]
    fn test_subscription_before_flag_takes_effect_later() {
        let (core, _primary, factory) = multiplexed(ChangeReasons::DEFAULT);
        core.subscribe(ChangeKind::SecurityChanged, |_| {}).unwrap();
        assert!(factory.handle_for(ChangeReasons::SECURITY).is_none());

        core.set_change_reasons(ChangeReasons::DEFAULT | ChangeReasons::SECURITY).unwrap();
        let security = factory.handle_for(ChangeReasons::SECURITY).unwrap();
        assert!(security.is_wired(NativeEventKind::Changed));
    }

    #[tokio::test]
    async fn test_fine_grained_isolation() {
        let (core, _primary, factory) =
            multiplexed(ChangeReasons::SIZE | ChangeReasons::ATTRIBUTES | ChangeReasons::LAST_ACCESS);
        let (tx, mut rx) = unbounded_channel();
        for kind in [ChangeKind::SizeChanged, ChangeKind::AttributeChanged, ChangeKind::LastAccessChanged] {
            let tx = tx.clone();
            core.subscribe(kind, move |event| {
                let _ = tx.send(event.clone());
            })
            .unwrap();
        }
        core.set_raising(true).unwrap();

        let size = factory.handle_for(ChangeReasons::SIZE).unwrap();
        assert!(size.is_enabled());
        assert!(size.emit_changed("data.bin"));

        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind(), ChangeKind::SizeChanged);
        assert_eq!(event.name(), Some(Path::new("data.bin")));

        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_satellites_added_while_raising_start_enabled() {
        let (core, _primary, factory) = multiplexed(ChangeReasons::DEFAULT);
        core.set_raising(true).unwrap();
        core.set_change_reasons(ChangeReasons::DEFAULT | ChangeReasons::SIZE).unwrap();
        assert!(factory.handle_for(ChangeReasons::SIZE).unwrap().is_enabled());

        core.set_raising(false).unwrap();
        for handle in factory.handles() {
            assert!(!handle.is_enabled());
        }
    }
}
