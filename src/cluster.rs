use std::path::PathBuf;
use std::sync::Arc;

use crate::proto::ServerInfo;
use crate::Result;

/// Cheap, shareable token identifying a locally open database. Handed to
/// the cluster in place of the raw connection handle.
#[derive(Debug, Clone)]
pub struct DatabaseRef {
    pub id: u32,
    pub path: Arc<PathBuf>,
}

/// Capabilities the gateway consumes from the replication layer.
///
/// `barrier` blocks until the local state machine has applied the log up to
/// the latest committed index, so reads observe a state at least as fresh
/// as when the request arrived. `checkpoint` performs the
/// cluster-coordinated WAL truncation. Both may block the calling thread:
/// the gateway runs handlers to completion and the embedding server must
/// size its worker pool accordingly.
pub trait Cluster: Send + Sync {
    /// Address of the current leader, if one is known.
    fn leader(&self) -> Option<String>;

    /// Live peer list.
    fn servers(&self) -> Result<Vec<ServerInfo>>;

    /// Invoked once for every database the gateway opens, before the open
    /// response is flushed. The replication layer attaches here.
    fn register(&self, db: &DatabaseRef);

    fn barrier(&self) -> Result<()>;

    /// Cluster-wide WAL truncation. Called from the engine's commit path;
    /// implementations must not call back into the gateway.
    fn checkpoint(&self, db: &DatabaseRef) -> Result<()>;
}
