//! # Configuration
//!
//! Startup configuration for the core thread and the object sync manager.
//! Loaded once from TOML, never touched on the hot path.
//!
//! ```toml
//! [thread]
//! mode = "worker"
//! thread_name = "core"
//! panic_policy = "log_and_continue"
//!
//! [sync]
//! buffer_count = 2
//! arena_capacity = 1048576
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Where the core thread runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreThreadMode {
    /// A dedicated worker thread is spawned by `start()`.
    #[default]
    Worker,
    /// The thread calling `start()` becomes the core thread and drives
    /// execution itself through `pump()` or `run()`.
    MainThread,
}

/// What happens when a queued command panics during playback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicPolicy {
    /// Log the panic and continue with the next record of the batch.
    ///
    /// An async operation owned by the panicking record is abandoned, so
    /// anyone waiting on it wakes up without a value.
    #[default]
    LogAndContinue,
    /// Log the panic and abort the process.
    Abort,
}

/// Core thread dispatcher configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreThreadConfig {
    /// Worker thread or caller-driven main thread.
    pub mode: CoreThreadMode,
    /// Name given to the spawned worker thread.
    pub thread_name: String,
    /// Panic handling at the playback boundary.
    pub panic_policy: PanicPolicy,
}

impl Default for CoreThreadConfig {
    fn default() -> Self {
        Self {
            mode: CoreThreadMode::Worker,
            thread_name: "core".to_string(),
            panic_policy: PanicPolicy::LogAndContinue,
        }
    }
}

impl CoreThreadConfig {
    /// Checks the configuration for values the dispatcher cannot honor.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` if the thread name is empty or
    /// contains a NUL byte.
    pub fn validate(&self) -> CoreResult<()> {
        if self.thread_name.is_empty() {
            return Err(CoreError::InvalidConfig("thread_name must not be empty".into()));
        }
        if self.thread_name.contains('\0') {
            return Err(CoreError::InvalidConfig("thread_name must not contain NUL".into()));
        }
        Ok(())
    }
}

/// Object sync manager configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectSyncConfig {
    /// Number of frame arena slots. Must be at least 2.
    pub buffer_count: usize,
    /// Initial capacity of each frame arena in bytes.
    pub arena_capacity: usize,
    /// How long the sim thread waits on a busy slot before logging a warning.
    pub slot_wait_warning_ms: u64,
}

impl Default for ObjectSyncConfig {
    fn default() -> Self {
        Self {
            buffer_count: 2,
            arena_capacity: 1024 * 1024,
            slot_wait_warning_ms: 1000,
        }
    }
}

impl ObjectSyncConfig {
    /// Checks the configuration for values the sync manager cannot honor.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` if fewer than two buffers are
    /// requested or the warning interval is zero.
    pub fn validate(&self) -> CoreResult<()> {
        if self.buffer_count < 2 {
            return Err(CoreError::InvalidConfig(format!(
                "buffer_count must be at least 2, got {}",
                self.buffer_count
            )));
        }
        if self.slot_wait_warning_ms == 0 {
            return Err(CoreError::InvalidConfig("slot_wait_warning_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Full configuration for the core subsystem.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Dispatcher settings.
    pub thread: CoreThreadConfig,
    /// Object sync settings.
    pub sync: ObjectSyncConfig,
}

impl CoreConfig {
    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` on a parse or validation failure.
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConfigIo` if the file cannot be read, or
    /// `CoreError::InvalidConfig` if its contents are rejected.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::ConfigIo(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first section error encountered.
    pub fn validate(&self) -> CoreResult<()> {
        self.thread.validate()?;
        self.sync.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.thread.mode, CoreThreadMode::Worker);
        assert_eq!(config.sync.buffer_count, 2);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = CoreConfig::from_toml_str(
            r#"
            [thread]
            mode = "main_thread"

            [sync]
            buffer_count = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.thread.mode, CoreThreadMode::MainThread);
        assert_eq!(config.thread.thread_name, "core");
        assert_eq!(config.thread.panic_policy, PanicPolicy::LogAndContinue);
        assert_eq!(config.sync.buffer_count, 3);
        assert_eq!(config.sync.arena_capacity, 1024 * 1024);
    }

    #[test]
    fn test_single_buffer_rejected() {
        let err = CoreConfig::from_toml_str("[sync]\nbuffer_count = 1\n").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = CoreConfig::from_toml_str("[thread]\nmode = \"fiber\"\n").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = CoreConfig::load("/definitely/not/here/tandem.toml").unwrap_err();
        assert!(matches!(err, CoreError::ConfigIo(_)));
    }
}
