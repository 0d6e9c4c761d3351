use std::time::Duration;

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SystemConfig {
    pub routing: RoutingConfig,
    pub storage: StorageConfig,
    pub lookup: LookupConfig,
    pub timing: TimingConfig,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RoutingConfig {
    // Also called k in the original paper: bucket capacity and
    // replication width
    pub bucket_size: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { bucket_size: 20 }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LookupConfig {
    // Also called alpha in the original paper
    // n. of nodes queried in parallel
    pub parallelism: u32,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self { parallelism: 3 }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TimingConfig {
    // Per-RPC deadline
    pub request_timeout: Duration,

    // Attempt budget for the retrying send helper
    pub max_retries: u32,

    // Maintenance cadence (bucket refresh)
    pub refresh_interval: Duration,

    // A contact is considered alive if heard from within this window
    pub liveness_window: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            refresh_interval: Duration::from_secs(5 * 60),
            liveness_window: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StorageConfig {
    // Maximum stored value size (in bytes), bounded by the datagram budget
    pub max_value_size: usize,

    // Maximum key size (in bytes)
    pub max_key_size: usize,

    // Maximum number of stored bindings
    pub max_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_value_size: 2048,
            max_key_size: 256,
            max_entries: 64 * 1024,
        }
    }
}
