use serde::{Deserialize, Serialize};

/// Configuration for the event bus
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusConfig {
    /// Log a warning when one subscriber's queue holds more undelivered
    /// events than this
    #[serde(default = "default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,
}

fn default_queue_warn_threshold() -> usize {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_warn_threshold: default_queue_warn_threshold(),
        }
    }
}
