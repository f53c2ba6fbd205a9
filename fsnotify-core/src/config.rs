//! Watch configuration loaded from TOML

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::dispatch::{QueueCapacity, DEFAULT_CAPACITY};
use crate::error::{Result, WatchError};
use crate::event::{ChangeKind, ChangeReasons, WatcherChangeTypes};
use crate::handle::HandleSettings;

/// Everything needed to build a watcher or a channel adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Directory to watch
    pub path: PathBuf,
    /// Glob applied to entry names, `*.*` for everything
    pub name_filter: String,
    /// Include subdirectories
    pub recursive: bool,
    /// Bound of the internal event queue
    pub capacity: i64,
    /// Change reasons to observe, by name (`file_name`, `size`, ... or `all`)
    pub change_reasons: Vec<String>,
    pub created_enabled: bool,
    pub changed_enabled: bool,
    pub deleted_enabled: bool,
    pub renamed_enabled: bool,
    /// Bound of the channel adapter's event channel
    pub event_channel_capacity: usize,
    /// Bound of the channel adapter's error channel
    pub error_channel_capacity: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            name_filter: glob_utils::MATCH_ALL.to_string(),
            recursive: false,
            capacity: DEFAULT_CAPACITY as i64,
            change_reasons: reason_names(ChangeReasons::DEFAULT),
            created_enabled: true,
            changed_enabled: true,
            deleted_enabled: true,
            renamed_enabled: true,
            event_channel_capacity: 1024,
            error_channel_capacity: 64,
        }
    }
}

impl WatchOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    pub fn with_filter(mut self, name_filter: impl Into<String>) -> Self {
        self.name_filter = name_filter.into();
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_capacity(mut self, capacity: i64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_change_reasons(mut self, reasons: ChangeReasons) -> Self {
        self.change_reasons = reason_names(reasons);
        self
    }

    /// Enable exactly the given delivery categories
    pub fn with_enabled(mut self, kinds: &[ChangeKind]) -> Self {
        self.created_enabled = kinds.contains(&ChangeKind::Created);
        self.deleted_enabled = kinds.contains(&ChangeKind::Deleted);
        self.renamed_enabled = kinds.contains(&ChangeKind::Renamed);
        self.changed_enabled = kinds.iter().any(|kind| kind.change_type() == WatcherChangeTypes::CHANGED);
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let options: Self = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| WatchError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&content)
    }

    /// Write the options as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| WatchError::Config { message: format!("failed to serialize options: {e}") })?;
        std::fs::write(path, content).map_err(|e| WatchError::Config {
            message: format!("failed to write {}: {}", path.display(), e),
        })
    }

    /// Check every field before anything native is touched
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(WatchError::invalid_argument("watch path must not be empty"));
        }
        self.queue_capacity()?;
        glob_utils::NameFilter::new(&self.name_filter)?;
        self.reasons()?;
        if self.event_channel_capacity == 0 || self.error_channel_capacity == 0 {
            return Err(WatchError::invalid_argument("channel capacities must be at least 1"));
        }
        Ok(())
    }

    /// The mask named by `change_reasons`
    pub fn reasons(&self) -> Result<ChangeReasons> {
        self.change_reasons.iter().try_fold(ChangeReasons::empty(), |mask, name| {
            ChangeReasons::from_config_name(name)
                .map(|flag| mask | flag)
                .ok_or_else(|| WatchError::invalid_argument(format!("unknown change reason '{name}'")))
        })
    }

    /// Event categories the enable flags select
    ///
    /// Fine-grained categories present in the mask replace the generic
    /// `Changed`; `changed_enabled` gates both.
    pub fn categories(&self) -> Result<Vec<ChangeKind>> {
        let fine_grained: Vec<ChangeKind> =
            self.reasons()?.fine_grained().iter().filter_map(ChangeKind::for_reason).collect();

        let mut kinds = Vec::new();
        if self.created_enabled {
            kinds.push(ChangeKind::Created);
        }
        if self.deleted_enabled {
            kinds.push(ChangeKind::Deleted);
        }
        if self.renamed_enabled {
            kinds.push(ChangeKind::Renamed);
        }
        if self.changed_enabled {
            if fine_grained.is_empty() {
                kinds.push(ChangeKind::Changed);
            } else {
                kinds.extend(fine_grained);
            }
        }
        Ok(kinds)
    }

    pub fn queue_capacity(&self) -> Result<QueueCapacity> {
        QueueCapacity::try_from(self.capacity)
    }

    pub fn handle_settings(&self) -> Result<HandleSettings> {
        Ok(HandleSettings::new(&self.path)
            .with_filter(self.name_filter.clone())
            .with_recursive(self.recursive)
            .with_change_reasons(self.reasons()?))
    }
}

/// Configuration names of every flag set in `mask`
pub fn reason_names(mask: ChangeReasons) -> Vec<String> {
    mask.iter_names().map(|(name, _)| name.to_ascii_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXAMPLE: &str = r#"
path = "/var/log"
name_filter = "*.log"
recursive = true
capacity = 256
change_reasons = ["file_name", "size", "last_write"]
renamed_enabled = false
"#;

    #[test]
    fn test_defaults() {
        let options = WatchOptions::default();
        assert_eq!(options.name_filter, "*.*");
        assert!(!options.recursive);
        assert_eq!(options.reasons().unwrap(), ChangeReasons::DEFAULT);
        assert!(options.created_enabled && options.changed_enabled);
        assert!(options.deleted_enabled && options.renamed_enabled);
        assert_eq!(options.queue_capacity().unwrap().get(), DEFAULT_CAPACITY);
        // No path yet
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_parse_example() {
        let options = WatchOptions::from_toml_str(EXAMPLE).unwrap();
        assert_eq!(options.path, PathBuf::from("/var/log"));
        assert_eq!(
            options.reasons().unwrap(),
            ChangeReasons::FILE_NAME | ChangeReasons::SIZE | ChangeReasons::LAST_WRITE
        );
        assert!(!options.renamed_enabled);
        assert_eq!(options.event_channel_capacity, 1024);

        let settings = options.handle_settings().unwrap();
        assert!(settings.recursive);
        assert_eq!(settings.name_filter, "*.log");
    }

    #[test]
    fn test_validation_failures() {
        let base = WatchOptions::new("/tmp");
        assert!(base.validate().is_ok());
        assert!(matches!(
            base.clone().with_capacity(0).validate(),
            Err(WatchError::InvalidCapacity { capacity: 0 })
        ));
        assert!(base.clone().with_filter("[bad").validate().is_err());

        let mut unknown = base.clone();
        unknown.change_reasons.push("colour".into());
        assert!(unknown.validate().is_err());

        assert!(WatchOptions::from_toml_str("capacity = 'lots'").unwrap_err().is_configuration_fault());
    }

    #[test]
    fn test_enabled_categories() {
        let options = WatchOptions::new("/tmp").with_enabled(&[ChangeKind::Created]);
        assert!(options.created_enabled);
        assert!(!options.changed_enabled && !options.deleted_enabled && !options.renamed_enabled);

        let options = WatchOptions::new("/tmp").with_enabled(&[ChangeKind::SizeChanged]);
        assert!(options.changed_enabled);
    }

    #[test]
    fn test_categories_follow_flags_and_mask() {
        let options = WatchOptions::new("/tmp").with_change_reasons(ChangeReasons::NAME_FLAGS);
        assert_eq!(
            options.categories().unwrap(),
            vec![ChangeKind::Created, ChangeKind::Deleted, ChangeKind::Renamed, ChangeKind::Changed]
        );

        let options = WatchOptions::new("/tmp")
            .with_change_reasons(ChangeReasons::FILE_NAME | ChangeReasons::SIZE | ChangeReasons::SECURITY)
            .with_enabled(&[ChangeKind::Deleted, ChangeKind::Changed]);
        assert_eq!(
            options.categories().unwrap(),
            vec![ChangeKind::Deleted, ChangeKind::SizeChanged, ChangeKind::SecurityChanged]
        );

        let mut unknown = WatchOptions::new("/tmp");
        unknown.change_reasons = vec!["colour".into()];
        assert!(unknown.categories().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("watch.toml");
        let options = WatchOptions::new("/srv").with_change_reasons(ChangeReasons::all());
        options.save(&file).unwrap();
        assert_eq!(WatchOptions::load(&file).unwrap(), options);
        assert!(WatchOptions::load(&temp_dir.path().join("missing.toml")).is_err());
    }
}
