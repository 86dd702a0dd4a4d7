//! Builder for configuring and starting a [`Scheduler`].

use crate::{Error, Result};
use lode_io::{FileSystem, LocalFileSystem};
use lode_streamer::{Scheduler, StageConfig, StreamerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Without a file system the builder reads from the working directory
/// through [`LocalFileSystem`].
///
/// # Example
///
/// ```ignore
/// use lode::prelude::*;
///
/// let scheduler = lode::builder()
///     .root("assets")
///     .thread_name("asset-streamer")
///     .build()?;
///
/// let request = scheduler.create_request();
/// scheduler.file_meta_data(&request, "level.pak");
/// scheduler.queue_request(&request);
/// ```
pub struct StreamerBuilder {
    config: StreamerConfig,
    file_system: Option<Arc<dyn FileSystem>>,
    root: Option<PathBuf>,
    start: bool,
}

impl Default for StreamerBuilder {
    fn default() -> Self {
        Self {
            config: StreamerConfig::default(),
            file_system: None,
            root: None,
            start: true,
        }
    }
}

impl StreamerBuilder {
    /// Builder over the default stack and the local file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole stack description.
    pub fn config(mut self, config: StreamerConfig) -> Self {
        self.config = config;
        self
    }

    /// Stages root to leaf. The last one must be a storage drive.
    pub fn stages(mut self, stages: Vec<StageConfig>) -> Self {
        self.config.stages = stages;
        self
    }

    /// Default: 4096
    pub fn hardware_alignment(mut self, alignment: u64) -> Self {
        self.config.hardware_alignment = alignment;
        self
    }

    /// Serve reads from `fs`.
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Resolve relative paths against `root` on the local disk.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Name of the scheduling thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.scheduler.thread_name = name.into();
        self
    }

    /// Default: false
    pub fn elevated_priority(mut self, elevated: bool) -> Self {
        self.config.scheduler.elevated_priority = elevated;
        self
    }

    /// Default: 50ms
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.scheduler.idle_timeout = timeout;
        self
    }

    /// Build without spawning the thread. Call [`Scheduler::start`] later.
    pub fn paused(mut self) -> Self {
        self.start = false;
        self
    }

    /// Build the scheduler and start its thread unless paused.
    ///
    /// # Errors
    ///
    /// Returns an error if the setup is contradictory, a stage config does
    /// not validate, or the thread cannot be spawned.
    pub fn build(self) -> Result<Scheduler> {
        let fs: Arc<dyn FileSystem> = match (self.file_system, self.root) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidSetup(
                    "a file system and a root can not both be set".to_string(),
                ))
            }
            (Some(fs), None) => fs,
            (None, Some(root)) => Arc::new(LocalFileSystem::with_root(root)),
            (None, None) => Arc::new(LocalFileSystem::new()),
        };

        let mut scheduler = Scheduler::new(&self.config, fs)?;
        if self.start {
            scheduler.start()?;
        }
        tracing::debug!(
            stages = self.config.stages.len(),
            started = self.start,
            "streamer built"
        );
        Ok(scheduler)
    }
}
