use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// WAL frames that must accumulate before a commit attempts a cluster
/// checkpoint.
pub const DEFAULT_CHECKPOINT_THRESHOLD: u32 = 1000;
/// Budget, in estimated encoded bytes, for a single rows batch.
pub const DEFAULT_BATCH_SIZE: usize = 4096;
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Immutable per-gateway configuration, consumed read-only.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Directory database files are created under.
    pub data_dir: PathBuf,
    /// VFS to open connections with, unless the open request names one.
    pub vfs: Option<String>,
    /// Name of the WAL replication implementation the cluster attaches when
    /// `Cluster::register` fires. The gateway itself only logs it.
    pub wal_replication: Option<String>,
    pub page_size: u32,
    /// In WAL pages. Commits that leave fewer frames than this never
    /// trigger a cluster checkpoint.
    pub checkpoint_threshold: u32,
    /// Advertised to clients in `Welcome` responses.
    pub heartbeat_timeout: Duration,
    /// A rows batch closes once its estimated encoded size reaches this
    /// many bytes.
    pub max_batch_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            vfs: None,
            wal_replication: None,
            page_size: DEFAULT_PAGE_SIZE,
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}
