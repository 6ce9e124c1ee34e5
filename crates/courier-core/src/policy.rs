use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub worker_count: usize,
    pub dispatch_tick_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            worker_count: 4,
            dispatch_tick_ms: 250,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 5 * 60 * 1_000,
        }
    }
}
