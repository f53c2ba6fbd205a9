//! Platform capability probe
//!
//! Which change reasons the native backend can ever report differs per OS.
//! The probe runs once and is handed to [`crate::NotifyHandleFactory`]; nothing
//! in the dispatch path consults global state.

use crate::event::ChangeReasons;

/// What the native watch backend on this platform is able to report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// Name of the backend `notify` selects on this platform
    pub backend: &'static str,
    /// Access events (read/open) are delivered
    pub reports_access_time: bool,
    /// Metadata changes are split out into permission/ownership sub-kinds
    pub reports_security: bool,
    /// Metadata changes surface at all (as opposed to generic modifications)
    pub reports_attributes: bool,
    /// Creation-time changes are distinguishable from other metadata
    pub reports_creation_time: bool,
}

impl PlatformCapabilities {
    /// Probe the current platform
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") || cfg!(target_os = "android") {
            Self {
                backend: "inotify",
                reports_access_time: true,
                reports_security: false,
                reports_attributes: true,
                reports_creation_time: false,
            }
        } else if cfg!(target_os = "macos") {
            Self {
                backend: "fsevents",
                reports_access_time: false,
                reports_security: true,
                reports_attributes: true,
                reports_creation_time: false,
            }
        } else if cfg!(windows) {
            Self {
                backend: "ReadDirectoryChangesW",
                reports_access_time: false,
                reports_security: false,
                reports_attributes: false,
                reports_creation_time: false,
            }
        } else {
            Self::minimal("kqueue")
        }
    }

    /// Capabilities of a backend that only reports names and generic writes
    pub fn minimal(backend: &'static str) -> Self {
        Self {
            backend,
            reports_access_time: false,
            reports_security: false,
            reports_attributes: false,
            reports_creation_time: false,
        }
    }

    /// Whether a single reason can ever be observed on this backend
    pub fn reports(&self, reason: ChangeReasons) -> bool {
        if reason == ChangeReasons::LAST_ACCESS {
            self.reports_access_time
        } else if reason == ChangeReasons::SECURITY {
            self.reports_security
        } else if reason == ChangeReasons::ATTRIBUTES {
            self.reports_attributes
        } else if reason == ChangeReasons::CREATION_TIME {
            self.reports_creation_time
        } else {
            true
        }
    }

    /// The subset of `mask` this backend never reports
    pub fn unreported(&self, mask: ChangeReasons) -> ChangeReasons {
        mask.iter().filter(|reason| !self.reports(*reason)).collect()
    }
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self::detect()
    }
}
