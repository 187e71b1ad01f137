//! Channel configuration.

use std::path::PathBuf;

/// Configuration for a file-backed channel's durable core.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel name, used in log and error context.
    pub name: String,
    /// Maximum number of events the index queue holds. Fixed at creation;
    /// reopening an existing checkpoint with a different capacity fails.
    pub capacity: usize,
    /// Path of the memory-mapped checkpoint file.
    pub checkpoint_path: PathBuf,
    /// Directories scanned for `log-<fileID>` transaction logs at startup.
    pub log_dirs: Vec<PathBuf>,
    /// Replay each log end-to-end on its own instead of merging all logs by
    /// write order. Only for old logs whose write-order IDs cannot be
    /// trusted across files.
    pub use_legacy_replay: bool,
}

impl ChannelConfig {
    /// Creates a configuration with no log directories and the default
    /// merge-based replay.
    pub fn new(
        name: impl Into<String>,
        checkpoint_path: impl Into<PathBuf>,
        capacity: usize,
    ) -> Self {
        Self {
            name: name.into(),
            capacity,
            checkpoint_path: checkpoint_path.into(),
            log_dirs: Vec::new(),
            use_legacy_replay: false,
        }
    }

    /// Adds a log directory to scan at startup.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dirs.push(dir.into());
        self
    }

    /// Selects the deprecated single-pass-per-file replay.
    #[must_use]
    pub fn with_legacy_replay(mut self, enabled: bool) -> Self {
        self.use_legacy_replay = enabled;
        self
    }
}
