//! Capabilities the search consumes from a cluster and a workload generator.
//!
//! Implementations must be shareable across threads: the crash monitor
//! polls [`Cluster::dead_nodes`] from a watcher thread while the workload
//! runs on another.

use crate::AdapterError;
use concprobe_types::{NodeId, QueryId};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("`{command}` timed out")]
    TimedOut { command: String },

    #[error(transparent)]
    Process(#[from] AdapterError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A set of long-running server processes plus a driver node.
pub trait Cluster: Send + Sync {
    fn start(&self, nodes: &[NodeId]) -> Result<(), ClusterError>;

    fn stop(&self, nodes: &[NodeId]) -> Result<(), ClusterError>;

    /// Run a shell command on `node`, returning its stdout.
    fn execute(&self, node: NodeId, cmd: &str) -> Result<String, ClusterError>;

    fn connect(&self, node: NodeId) -> Result<Box<dyn SqlConn>, ClusterError>;

    /// Members of `nodes` whose server process is not running.
    ///
    /// Must not start, stop, or otherwise disturb any process.
    fn dead_nodes(&self, nodes: &[NodeId]) -> Result<Vec<NodeId>, ClusterError>;

    /// Block until every range has at least `min_copies` replicas. Fails
    /// only when the check itself cannot run.
    fn wait_for_replication(&self, min_copies: u32) -> Result<(), ClusterError>;

    fn artifacts_dir(&self) -> &Path;
}

/// A client session against one server.
pub trait SqlConn: Send {
    fn execute(&mut self, statement: &str) -> Result<(), ClusterError>;
}

/// Bounded batches of client operations.
pub trait WorkloadRunner: Send + Sync {
    /// Run `query` on `concurrency` connections from `driver` until roughly
    /// `max_ops` operations have completed. Blocks until the batch is done.
    fn run_batch(
        &self,
        driver: NodeId,
        query: QueryId,
        concurrency: u32,
        max_ops: u32,
    ) -> Result<(), ClusterError>;

    /// Terminate worker processes a previous batch left on `driver`.
    fn kill_stragglers(&self, driver: NodeId) -> Result<(), ClusterError>;
}
