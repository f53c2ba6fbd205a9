use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use fsnotify_core::WatchOptions;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "fsnotify",
    version,
    about = "Watch a directory and print filesystem change events",
    long_about = "Watches a directory through a buffered, multiplexed watcher and prints every change until interrupted. Events can be consumed through handlers, channels or streams."
)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory to watch
    pub path: Option<PathBuf>,

    /// Name filter glob, e.g. "*.txt"
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Include subdirectories
    #[arg(short, long)]
    pub recursive: bool,

    /// How events are consumed
    #[arg(short, long, value_enum, default_value_t = Mode::Callback)]
    pub mode: Mode,

    /// Change reasons to observe (comma separated, e.g. "file_name,size" or "all")
    #[arg(long, value_delimiter = ',')]
    pub reasons: Vec<String>,

    /// Bound of the internal event queue
    #[arg(long, allow_negative_numbers = true)]
    pub capacity: Option<i64>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Register a handler per category
    Callback,
    /// Read from the event and error channels
    Channel,
    /// Consume per-category streams
    Stream,
}

impl Cli {
    /// Merge the configuration file (if any) with command line overrides
    pub fn options(&self) -> Result<WatchOptions> {
        let mut options = match &self.config {
            Some(path) => WatchOptions::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => WatchOptions::default(),
        };

        if let Some(path) = &self.path {
            options.path = path.clone();
        }
        if options.path.as_os_str().is_empty() {
            bail!("No directory to watch; pass a path or set `path` in the configuration file");
        }
        if let Some(filter) = &self.filter {
            options.name_filter = filter.clone();
        }
        if self.recursive {
            options.recursive = true;
        }
        if !self.reasons.is_empty() {
            options.change_reasons = self.reasons.clone();
        }
        if let Some(capacity) = self.capacity {
            options.capacity = capacity;
        }

        options.validate().context("Invalid watch options")?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsnotify_core::ChangeReasons;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "fsnotify", "/tmp", "--filter", "*.log", "-r", "--mode", "channel", "--reasons", "size,last_write",
            "--capacity", "16",
        ]);
        assert_eq!(cli.mode, Mode::Channel);
        let options = cli.options().unwrap();
        assert_eq!(options.name_filter, "*.log");
        assert!(options.recursive);
        assert_eq!(options.capacity, 16);
        assert_eq!(options.reasons().unwrap(), ChangeReasons::SIZE | ChangeReasons::LAST_WRITE);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Cli::parse_from(["fsnotify"]).options().is_err());
        let fault = Cli::parse_from(["fsnotify", "/tmp", "--reasons", "colour"]).options().unwrap_err();
        let message = format!("{fault:#}");
        assert!(message.starts_with("Invalid watch options"), "{message}");
        assert!(message.contains("colour"), "{message}");
        assert!(Cli::parse_from(["fsnotify", "/tmp", "--capacity", "0"]).options().is_err());
        assert!(Cli::parse_from(["fsnotify", "/tmp", "--filter", "[x"]).options().is_err());
    }
}
