//! Change events and the flag sets that describe them

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, WatchError};

bitflags! {
    /// Reasons a watch can be configured to notice
    ///
    /// Bit values match the conventional native notify-filter values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct ChangeReasons: u32 {
        const FILE_NAME = 0x1;
        const DIRECTORY_NAME = 0x2;
        const ATTRIBUTES = 0x4;
        const SIZE = 0x8;
        const LAST_WRITE = 0x10;
        const LAST_ACCESS = 0x20;
        const CREATION_TIME = 0x40;
        const SECURITY = 0x100;
    }
}

impl ChangeReasons {
    /// Conservative native default: name changes plus last-write changes
    pub const DEFAULT: ChangeReasons = ChangeReasons::FILE_NAME
        .union(ChangeReasons::DIRECTORY_NAME)
        .union(ChangeReasons::LAST_WRITE);

    /// Flags inferred from create/delete/rename rather than from a change event
    pub const NAME_FLAGS: ChangeReasons =
        ChangeReasons::FILE_NAME.union(ChangeReasons::DIRECTORY_NAME);

    /// Validate raw bits, rejecting anything outside the known flags
    pub fn validate(bits: u32) -> Result<ChangeReasons> {
        ChangeReasons::from_bits(bits).ok_or(WatchError::InvalidChangeReasons { bits })
    }

    /// Re-check a value that may have been built with `from_bits_retain`
    pub fn ensure_valid(self) -> Result<ChangeReasons> {
        Self::validate(self.bits())
    }

    /// The individual flags that get a dedicated handle of their own
    pub fn fine_grained(self) -> ChangeReasons {
        self.difference(Self::NAME_FLAGS)
    }

    /// Parse a flag from its snake-case configuration name
    pub fn from_config_name(name: &str) -> Option<ChangeReasons> {
        let flag = match name.trim().to_ascii_lowercase().as_str() {
            "file_name" => ChangeReasons::FILE_NAME,
            "directory_name" => ChangeReasons::DIRECTORY_NAME,
            "attributes" => ChangeReasons::ATTRIBUTES,
            "size" => ChangeReasons::SIZE,
            "last_write" => ChangeReasons::LAST_WRITE,
            "last_access" => ChangeReasons::LAST_ACCESS,
            "creation_time" => ChangeReasons::CREATION_TIME,
            "security" => ChangeReasons::SECURITY,
            "all" => ChangeReasons::all(),
            _ => return None,
        };
        Some(flag)
    }
}

impl Default for ChangeReasons {
    fn default() -> Self {
        ChangeReasons::DEFAULT
    }
}

impl TryFrom<u32> for ChangeReasons {
    type Error = WatchError;

    fn try_from(bits: u32) -> Result<Self> {
        ChangeReasons::validate(bits)
    }
}

bitflags! {
    /// Kinds of change a synchronous wait can be asked to observe
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WatcherChangeTypes: u8 {
        const CREATED = 0x1;
        const DELETED = 0x2;
        const CHANGED = 0x4;
        const RENAMED = 0x8;
        const ALL = Self::CREATED.bits() | Self::DELETED.bits() | Self::CHANGED.bits() | Self::RENAMED.bits();
    }
}

impl WatcherChangeTypes {
    pub fn validate(self) -> Result<WatcherChangeTypes> {
        if self.is_empty() || WatcherChangeTypes::from_bits(self.bits()).is_none() {
            return Err(WatchError::invalid_argument(format!(
                "change type set {:#x} must be a non-empty combination of known types",
                self.bits()
            )));
        }
        Ok(self)
    }
}

/// Category of a delivered change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
    Renamed,
    // The following are refinements of `Changed`
    AttributeChanged,
    CreationTimeChanged,
    LastAccessChanged,
    LastWriteChanged,
    SecurityChanged,
    SizeChanged,
}

impl ChangeKind {
    pub const FINE_GRAINED: [ChangeKind; 6] = [
        ChangeKind::AttributeChanged,
        ChangeKind::CreationTimeChanged,
        ChangeKind::LastAccessChanged,
        ChangeKind::LastWriteChanged,
        ChangeKind::SecurityChanged,
        ChangeKind::SizeChanged,
    ];

    pub fn is_fine_grained(self) -> bool {
        self.reason().is_some()
    }

    /// The single change reason isolated by this category
    pub fn reason(self) -> Option<ChangeReasons> {
        match self {
            ChangeKind::AttributeChanged => Some(ChangeReasons::ATTRIBUTES),
            ChangeKind::CreationTimeChanged => Some(ChangeReasons::CREATION_TIME),
            ChangeKind::LastAccessChanged => Some(ChangeReasons::LAST_ACCESS),
            ChangeKind::LastWriteChanged => Some(ChangeReasons::LAST_WRITE),
            ChangeKind::SecurityChanged => Some(ChangeReasons::SECURITY),
            ChangeKind::SizeChanged => Some(ChangeReasons::SIZE),
            ChangeKind::Created | ChangeKind::Changed | ChangeKind::Deleted | ChangeKind::Renamed => {
                None
            }
        }
    }

    /// The category a dedicated single-flag handle reports into
    pub fn for_reason(reason: ChangeReasons) -> Option<ChangeKind> {
        ChangeKind::FINE_GRAINED.into_iter().find(|kind| kind.reason() == Some(reason))
    }

    /// The coarse change type this category is a refinement of
    pub fn change_type(self) -> WatcherChangeTypes {
        match self {
            ChangeKind::Created => WatcherChangeTypes::CREATED,
            ChangeKind::Deleted => WatcherChangeTypes::DELETED,
            ChangeKind::Renamed => WatcherChangeTypes::RENAMED,
            _ => WatcherChangeTypes::CHANGED,
        }
    }
}

/// Original identity of a renamed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RenameOrigin {
    old_name: PathBuf,
}

/// One filesystem occurrence, immutable once classified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    kind: ChangeKind,
    directory: PathBuf,
    name: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<RenameOrigin>,
}

impl ChangeEvent {
    /// Create a non-rename event
    pub fn new(kind: ChangeKind, directory: impl Into<PathBuf>, name: Option<PathBuf>) -> Result<Self> {
        if kind == ChangeKind::Renamed {
            return Err(WatchError::invalid_argument(
                "renamed events must be built with ChangeEvent::renamed",
            ));
        }
        Ok(Self { kind, directory: directory.into(), name, origin: None })
    }

    /// Create a rename event from the old and new relative names
    pub fn renamed(
        directory: impl Into<PathBuf>,
        old_name: impl Into<PathBuf>,
        name: Option<PathBuf>,
    ) -> Self {
        Self {
            kind: ChangeKind::Renamed,
            directory: directory.into(),
            name,
            origin: Some(RenameOrigin { old_name: old_name.into() }),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// The watched root at the time of the event
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The affected entry, relative to the watched root
    pub fn name(&self) -> Option<&Path> {
        self.name.as_deref()
    }

    pub fn full_path(&self) -> PathBuf {
        match &self.name {
            Some(name) => self.directory.join(name),
            None => self.directory.clone(),
        }
    }

    pub fn old_name(&self) -> Option<&Path> {
        self.origin.as_ref().map(|origin| origin.old_name.as_path())
    }

    pub fn old_full_path(&self) -> Option<PathBuf> {
        self.origin.as_ref().map(|origin| self.directory.join(&origin.old_name))
    }
}

/// Outcome of a synchronous wait for a change
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WaitForChangeResult {
    pub change_type: Option<WatcherChangeTypes>,
    pub name: Option<PathBuf>,
    pub old_name: Option<PathBuf>,
    pub timed_out: bool,
}

impl WaitForChangeResult {
    pub fn timed_out() -> Self {
        Self { timed_out: true, ..Self::default() }
    }
}
