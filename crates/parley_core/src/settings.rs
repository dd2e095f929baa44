use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and limit knobs for the state machines. All durations are in
/// milliseconds so the values stay readable in the system config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Delay before the first chunk is revealed.
    pub first_tick_delay_ms: u64,
    /// Delay between subsequent chunk reveals.
    pub tick_interval_ms: u64,
    /// Budget for starting every enabled plugin (spawn + handshake).
    pub plugin_start_timeout_ms: u64,
    /// Budget for shutting down every plugin. Kept short so quitting never hangs.
    pub plugin_stop_timeout_ms: u64,
    /// Budget for enabling or disabling a single plugin.
    pub plugin_operation_timeout_ms: u64,
    /// Wrong passphrases accepted before a data directory switch is abandoned.
    pub max_passphrase_attempts: u32,
    /// Interval of the runtime's clock tick.
    pub clock_tick_ms: u64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            first_tick_delay_ms: 1,
            tick_interval_ms: 30,
            plugin_start_timeout_ms: 30_000,
            plugin_stop_timeout_ms: 2_000,
            plugin_operation_timeout_ms: 3_000,
            max_passphrase_attempts: 3,
            clock_tick_ms: 250,
        }
    }
}

impl CoreSettings {
    pub fn first_tick_delay(&self) -> Duration {
        Duration::from_millis(self.first_tick_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn plugin_start_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_start_timeout_ms)
    }

    pub fn plugin_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_stop_timeout_ms)
    }

    pub fn plugin_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_operation_timeout_ms)
    }

    pub fn clock_tick(&self) -> Duration {
        Duration::from_millis(self.clock_tick_ms)
    }
}
