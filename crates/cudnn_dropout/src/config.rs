use crate::ScratchPolicy;
use serde::Deserialize;
use std::env;

/// Environment variable read by [`DropoutConfig::from_env`] to enable debug synchronization.
pub const DEBUG_SYNC_ENV: &str = "CUDNN_DROPOUT_DEBUG_SYNC";
/// Environment variable read by [`DropoutConfig::from_env`] for the initial scratch margin.
pub const SCRATCH_MARGIN_ENV: &str = "CUDNN_DROPOUT_SCRATCH_MARGIN";

/// Construction-time settings of a [`DropoutHelper`](crate::DropoutHelper).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DropoutConfig {
    /// Block the calling thread until the bound stream drains after every kernel.
    /// Only meant for deterministic debugging, it serializes host and device work.
    /// `false` by default.
    pub debug_sync: bool,
    /// Scratch buffer sizing.
    pub scratch: ScratchPolicy,
}

impl DropoutConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by [`DEBUG_SYNC_ENV`] and [`SCRATCH_MARGIN_ENV`] when they are set to
    /// parseable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = env::var(DEBUG_SYNC_ENV) {
            config.debug_sync = matches!(value.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(margin) = env::var(SCRATCH_MARGIN_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            config.scratch.margin_bytes = margin;
        }
        config
    }

    pub fn debug_sync(mut self, debug_sync: bool) -> Self {
        self.debug_sync = debug_sync;
        self
    }

    pub fn scratch_margin(mut self, bytes: usize) -> Self {
        self.scratch.margin_bytes = bytes;
        self
    }

    pub fn scratch_retry_limit(mut self, limit: u32) -> Self {
        self.scratch.retry_limit = limit;
        self
    }

    pub fn scratch_alignment(mut self, alignment: usize) -> Self {
        self.scratch.alignment = alignment;
        self
    }
}
