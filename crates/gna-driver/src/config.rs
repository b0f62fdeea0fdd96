//! Driver configuration.
//!
//! Defaults match production hardware. `from_env` lets test rigs and the
//! CLI tune timeouts without recompiling.

use crate::poll::PollPolicy;
use std::time::Duration;
use tracing::warn;

/// How many memory contexts a session may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryScope {
    /// Legacy protocol: one model per session
    Single,
    /// Many memory contexts per session
    Multi {
        /// Table capacity
        capacity: usize,
    },
}

impl RegistryScope {
    /// Table capacity
    pub const fn capacity(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Multi { capacity } => capacity,
        }
    }
}

impl Default for RegistryScope {
    fn default() -> Self {
        Self::Multi { capacity: 64 }
    }
}

/// Tunables for one [`Device`](crate::device::Device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Recovery timer armed for every started request
    pub score_timeout: Duration,
    /// Budget for abort and power-transition polls
    pub poll: PollPolicy,
    /// Memory table shape for new sessions
    pub registry_scope: RegistryScope,
    /// Leave the device in D0 after completion so registers can be inspected
    pub preserve_registers: bool,
    /// Value programmed into `IBUFFS` at prepare time
    pub input_buffer_size: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            score_timeout: Duration::from_secs(2),
            poll: PollPolicy::default(),
            registry_scope: RegistryScope::default(),
            preserve_registers: false,
            input_buffer_size: 0x8000,
        }
    }
}

impl DriverConfig {
    /// Defaults overridden from `GNA_SCORE_TIMEOUT_MS`, `GNA_POLL_ATTEMPTS`
    /// and `GNA_PRESERVE_REGISTERS`. Malformed values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("GNA_SCORE_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.score_timeout = Duration::from_millis(ms),
                _ => warn!("Ignoring GNA_SCORE_TIMEOUT_MS={raw:?}"),
            }
        }
        if let Some(raw) = lookup("GNA_POLL_ATTEMPTS") {
            match raw.trim().parse::<u32>() {
                Ok(attempts) if attempts > 0 => config.poll.max_attempts = attempts,
                _ => warn!("Ignoring GNA_POLL_ATTEMPTS={raw:?}"),
            }
        }
        if let Some(raw) = lookup("GNA_PRESERVE_REGISTERS") {
            match raw.trim() {
                "1" | "true" | "yes" => config.preserve_registers = true,
                "0" | "false" | "no" => config.preserve_registers = false,
                _ => warn!("Ignoring GNA_PRESERVE_REGISTERS={raw:?}"),
            }
        }
        config
    }

    /// Set the recovery timeout
    #[must_use]
    pub const fn with_score_timeout(mut self, timeout: Duration) -> Self {
        self.score_timeout = timeout;
        self
    }

    /// Set the poll budget
    #[must_use]
    pub const fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Set the memory table shape
    #[must_use]
    pub const fn with_registry_scope(mut self, scope: RegistryScope) -> Self {
        self.registry_scope = scope;
        self
    }

    /// Keep the device awake after completion
    #[must_use]
    pub const fn with_preserve_registers(mut self, preserve: bool) -> Self {
        self.preserve_registers = preserve;
        self
    }
}
