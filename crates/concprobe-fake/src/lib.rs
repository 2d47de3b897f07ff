//! In-memory fakes for concprobe tests.
//!
//! [`FakeCluster`] tracks which server processes are running and records
//! every call. [`FakeWorkload`] decides per batch whether the cluster
//! survives, and can kill a node to simulate an out-of-memory crash.

use concprobe_adapters::{Cluster, ClusterError, SqlConn, WorkloadRunner};
use concprobe_types::{NodeId, QueryId};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// A call observed by [`FakeCluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Start(Vec<NodeId>),
    Stop(Vec<NodeId>),
    Execute { node: NodeId, cmd: String },
    Sql { node: NodeId, statement: String },
    WaitForReplication(u32),
    Killed(NodeId),
}

#[derive(Debug, Default)]
struct ClusterState {
    running: BTreeSet<NodeId>,
    events: Vec<ClusterEvent>,
    failing_statement: Option<String>,
    failing_start: bool,
    failing_liveness: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A cluster whose processes exist only as entries in a set.
///
/// Nodes start out stopped. A stop followed by a start revives nodes killed
/// with [`FakeCluster::kill_node`].
#[derive(Debug)]
pub struct FakeCluster {
    artifacts_dir: PathBuf,
    state: Arc<Mutex<ClusterState>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            artifacts_dir: PathBuf::from(concprobe_types::DEFAULT_ARTIFACTS_DIR),
            state: Arc::default(),
        }
    }

    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = dir.into();
        self
    }

    /// Make every SQL statement containing `needle` fail.
    pub fn fail_statements_containing(&self, needle: &str) {
        lock(&self.state).failing_statement = Some(needle.to_string());
    }

    pub fn fail_start(&self, fail: bool) {
        lock(&self.state).failing_start = fail;
    }

    /// Make [`Cluster::dead_nodes`] itself return an error.
    pub fn fail_liveness_checks(&self, fail: bool) {
        lock(&self.state).failing_liveness = fail;
    }

    /// Simulate the server process on `node` dying.
    pub fn kill_node(&self, node: NodeId) {
        let mut state = lock(&self.state);
        state.running.remove(&node);
        state.events.push(ClusterEvent::Killed(node));
    }

    pub fn is_running(&self, node: NodeId) -> bool {
        lock(&self.state).running.contains(&node)
    }

    pub fn running_nodes(&self) -> Vec<NodeId> {
        lock(&self.state).running.iter().copied().collect()
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        lock(&self.state).events.clone()
    }

    pub fn clear_events(&self) {
        lock(&self.state).events.clear();
    }

    /// SQL statements executed on `node`, in order.
    pub fn statements_on(&self, node: NodeId) -> Vec<String> {
        lock(&self.state)
            .events
            .iter()
            .filter_map(|e| match e {
                ClusterEvent::Sql { node: n, statement } if *n == node => Some(statement.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn restarts(&self) -> usize {
        lock(&self.state)
            .events
            .iter()
            .filter(|e| matches!(e, ClusterEvent::Start(_)))
            .count()
    }
}

impl Cluster for FakeCluster {
    fn start(&self, nodes: &[NodeId]) -> Result<(), ClusterError> {
        let mut state = lock(&self.state);
        state.events.push(ClusterEvent::Start(nodes.to_vec()));
        if state.failing_start {
            return Err(anyhow::anyhow!("fake start failure").into());
        }
        state.running.extend(nodes.iter().copied());
        Ok(())
    }

    fn stop(&self, nodes: &[NodeId]) -> Result<(), ClusterError> {
        let mut state = lock(&self.state);
        state.events.push(ClusterEvent::Stop(nodes.to_vec()));
        for node in nodes {
            state.running.remove(node);
        }
        Ok(())
    }

    fn execute(&self, node: NodeId, cmd: &str) -> Result<String, ClusterError> {
        lock(&self.state).events.push(ClusterEvent::Execute {
            node,
            cmd: cmd.to_string(),
        });
        Ok(String::new())
    }

    fn connect(&self, node: NodeId) -> Result<Box<dyn SqlConn>, ClusterError> {
        if !self.is_running(node) {
            return Err(anyhow::anyhow!("node {node} is not running").into());
        }
        Ok(Box::new(FakeSqlConn {
            node,
            state: Arc::clone(&self.state),
        }))
    }

    fn dead_nodes(&self, nodes: &[NodeId]) -> Result<Vec<NodeId>, ClusterError> {
        let state = lock(&self.state);
        if state.failing_liveness {
            return Err(anyhow::anyhow!("fake liveness check failure").into());
        }
        Ok(nodes
            .iter()
            .copied()
            .filter(|n| !state.running.contains(n))
            .collect())
    }

    fn wait_for_replication(&self, min_copies: u32) -> Result<(), ClusterError> {
        lock(&self.state)
            .events
            .push(ClusterEvent::WaitForReplication(min_copies));
        Ok(())
    }

    fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }
}

struct FakeSqlConn {
    node: NodeId,
    state: Arc<Mutex<ClusterState>>,
}

impl SqlConn for FakeSqlConn {
    fn execute(&mut self, statement: &str) -> Result<(), ClusterError> {
        let mut state = lock(&self.state);
        if !state.running.contains(&self.node) {
            return Err(anyhow::anyhow!("connection to node {} lost", self.node).into());
        }
        state.events.push(ClusterEvent::Sql {
            node: self.node,
            statement: statement.to_string(),
        });
        if let Some(needle) = &state.failing_statement {
            if statement.contains(needle.as_str()) {
                return Err(anyhow::anyhow!("statement failed: {statement}").into());
            }
        }
        Ok(())
    }
}

/// How the fake cluster reacts to a batch at a given concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Every batch completes.
    Unlimited,

    /// Batches above `threshold` kill `victim`; the batch itself still
    /// reports success, as a workload run with `--tolerate-errors` would.
    CrashAbove { threshold: u32, victim: NodeId },

    /// Batches above `threshold` return an error; no node dies.
    FailAbove { threshold: u32 },
}

/// A batch observed by [`FakeWorkload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub driver: NodeId,
    pub query: QueryId,
    pub concurrency: u32,
    pub max_ops: u32,
}

#[derive(Debug, Default)]
struct WorkloadState {
    batches: Vec<Batch>,
    stragglers: u32,
    kills: u32,
    failing_kill: bool,
}

pub struct FakeWorkload {
    cluster: Arc<FakeCluster>,
    capacity: Capacity,
    batch_delay: Duration,
    hang_after_crash: Duration,
    state: Mutex<WorkloadState>,
}

impl FakeWorkload {
    pub fn new(cluster: Arc<FakeCluster>, capacity: Capacity) -> Self {
        Self {
            cluster,
            capacity,
            batch_delay: Duration::ZERO,
            hang_after_crash: Duration::ZERO,
            state: Mutex::default(),
        }
    }

    /// Sleep this long inside every batch.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Keep a crashing batch running this long after it killed its victim,
    /// like a client retrying against a dead node.
    pub fn with_hang_after_crash(mut self, delay: Duration) -> Self {
        self.hang_after_crash = delay;
        self
    }

    pub fn fail_kill(&self, fail: bool) {
        lock(&self.state).failing_kill = fail;
    }

    pub fn batches(&self) -> Vec<Batch> {
        lock(&self.state).batches.clone()
    }

    /// Distinct concurrency levels in the order they were first run.
    pub fn probed_levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = Vec::new();
        for b in lock(&self.state).batches.iter() {
            if levels.last() != Some(&b.concurrency) {
                levels.push(b.concurrency);
            }
        }
        levels
    }

    /// Batches started since the last successful [`WorkloadRunner::kill_stragglers`].
    pub fn stragglers(&self) -> u32 {
        lock(&self.state).stragglers
    }

    pub fn kills(&self) -> u32 {
        lock(&self.state).kills
    }
}

impl WorkloadRunner for FakeWorkload {
    fn run_batch(
        &self,
        driver: NodeId,
        query: QueryId,
        concurrency: u32,
        max_ops: u32,
    ) -> Result<(), ClusterError> {
        {
            let mut state = lock(&self.state);
            state.batches.push(Batch {
                driver,
                query,
                concurrency,
                max_ops,
            });
            state.stragglers += 1;
        }

        if !self.batch_delay.is_zero() {
            thread::sleep(self.batch_delay);
        }

        match self.capacity {
            Capacity::Unlimited => Ok(()),
            Capacity::CrashAbove { threshold, victim } => {
                if concurrency > threshold {
                    self.cluster.kill_node(victim);
                    if !self.hang_after_crash.is_zero() {
                        thread::sleep(self.hang_after_crash);
                    }
                }
                Ok(())
            }
            Capacity::FailAbove { threshold } => {
                if concurrency > threshold {
                    return Err(anyhow::anyhow!(
                        "query {query} failed at concurrency {concurrency}"
                    )
                    .into());
                }
                Ok(())
            }
        }
    }

    fn kill_stragglers(&self, _driver: NodeId) -> Result<(), ClusterError> {
        let mut state = lock(&self.state);
        state.kills += 1;
        if state.failing_kill {
            return Err(anyhow::anyhow!("killall: no process found").into());
        }
        state.stragglers = 0;
        Ok(())
    }
}
