//! The probe orchestrator: setup, reset + probe per bisection step, recovery.

use crate::Clock;
use crate::prober::ConcurrencyProber;
use anyhow::Context;
use concprobe_adapters::{Cluster, WorkloadRunner};
use concprobe_domain::{QueryCatalog, SearchInterval, bisect, max_ops_for};
use concprobe_types::{
    MaxConcurrencyStats, NodeId, ProbeRecord, RunMeta, STATS_FILE_NAME, SearchReceipt, ToolInfo,
    WorkloadMeta,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything about the cluster and workload that stays fixed for a run.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub servers: Vec<NodeId>,
    pub driver: NodeId,
    pub poll_interval: Duration,
    pub catalog: QueryCatalog,
    pub workload_name: String,

    /// Database selected before scattering and warming tables.
    pub database: Option<String>,
    pub tables: Vec<String>,

    /// Run once on the first server before the first probe.
    pub setup_statements: Vec<String>,

    /// Run once on the driver after setup statements, e.g. a data import.
    pub load: Option<String>,
    pub replication_factor: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSearchRequest {
    pub min_concurrency: u32,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub stats: MaxConcurrencyStats,
    pub receipt: SearchReceipt,

    /// Where `stats` belongs: `stats.json` in the cluster's artifacts directory.
    pub stats_path: PathBuf,
}

pub struct ProbeSearchUseCase<C, W, K>
where
    C: Cluster + ?Sized + 'static,
    W: WorkloadRunner + ?Sized + 'static,
    K: Clock,
{
    cluster: Arc<C>,
    workload: Arc<W>,
    prober: ConcurrencyProber<C, W>,
    clock: K,
    tool: ToolInfo,
    settings: SearchSettings,
}

struct Probed {
    concurrency: u32,
    reason: Option<String>,
    wall_ms: u64,
}

impl<C, W, K> ProbeSearchUseCase<C, W, K>
where
    C: Cluster + ?Sized + 'static,
    W: WorkloadRunner + ?Sized + 'static,
    K: Clock,
{
    pub fn new(
        cluster: Arc<C>,
        workload: Arc<W>,
        clock: K,
        tool: ToolInfo,
        settings: SearchSettings,
    ) -> Self {
        let prober = ConcurrencyProber::new(
            Arc::clone(&cluster),
            Arc::clone(&workload),
            settings.servers.clone(),
            settings.driver,
            settings.catalog.clone(),
            settings.poll_interval,
        );
        Self {
            cluster,
            workload,
            prober,
            clock,
            tool,
            settings,
        }
    }

    pub fn execute(&self, req: ProbeSearchRequest) -> anyhow::Result<SearchOutcome> {
        let initial = SearchInterval::new(req.min_concurrency, req.max_concurrency)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = self.clock.now_rfc3339();

        tracing::info!(
            min = initial.low(),
            max = initial.high(),
            max_probes = initial.max_probes(),
            "searching for max supported concurrency"
        );

        self.setup().context("cluster setup")?;

        let mut probed: Vec<Probed> = Vec::new();
        let trace = bisect(initial, |concurrency, _| -> anyhow::Result<_> {
            self.prepare_probe()
                .with_context(|| format!("reset cluster before probing {concurrency}"))?;

            let start = Instant::now();
            let outcome = self.prober.probe(concurrency)?;
            probed.push(Probed {
                concurrency,
                reason: outcome.reason(),
                wall_ms: start.elapsed().as_millis() as u64,
            });
            Ok(outcome.status())
        })?;

        self.clear_workload();
        self.restart().context("final restart")?;

        let max_concurrency = trace.max_concurrency;
        tracing::info!("max supported concurrency is {max_concurrency}");

        let probes = trace
            .steps
            .iter()
            .zip(probed)
            .map(|(step, p)| {
                debug_assert_eq!(step.concurrency, p.concurrency);
                ProbeRecord {
                    concurrency: step.concurrency,
                    max_ops: max_ops_for(step.concurrency),
                    status: step.status,
                    reason: p.reason,
                    after: step.after.bounds(),
                    wall_ms: p.wall_ms,
                }
            })
            .collect();

        let stats = MaxConcurrencyStats { max_concurrency };
        let receipt = SearchReceipt {
            schema: concprobe_types::SEARCH_SCHEMA_V1.to_string(),
            tool: self.tool.clone(),
            run: RunMeta {
                id: run_id,
                started_at,
                ended_at: self.clock.now_rfc3339(),
            },
            workload: WorkloadMeta {
                name: self.settings.workload_name.clone(),
                queries: self.settings.catalog.len(),
            },
            initial: initial.bounds(),
            probes,
            result: stats,
        };

        Ok(SearchOutcome {
            stats,
            receipt,
            stats_path: self.cluster.artifacts_dir().join(STATS_FILE_NAME),
        })
    }

    /// One-time cluster preparation: start, tune, load.
    pub fn setup(&self) -> anyhow::Result<()> {
        let servers = &self.settings.servers;
        self.cluster.start(servers).context("start servers")?;

        if !self.settings.setup_statements.is_empty() {
            let first = self.first_server()?;
            let mut conn = self
                .cluster
                .connect(first)
                .with_context(|| format!("connect to node {first}"))?;
            for statement in &self.settings.setup_statements {
                conn.execute(statement)
                    .with_context(|| format!("setup statement {statement:?}"))?;
            }
        }

        if let Some(load) = &self.settings.load {
            tracing::info!("loading dataset");
            self.cluster
                .execute(self.settings.driver, load)
                .context("load dataset")?;
        }
        Ok(())
    }

    /// Return the cluster to a clean, warm state before a probe.
    ///
    /// Leftover workload processes are killed, servers restarted, data
    /// scattered and fully replicated, and every table touched from every
    /// server so range caches are populated.
    pub fn prepare_probe(&self) -> anyhow::Result<()> {
        self.clear_workload();
        self.restart()?;

        let first = self.first_server()?;
        let mut conn = self
            .cluster
            .connect(first)
            .with_context(|| format!("connect to node {first}"))?;
        self.use_database(conn.as_mut())?;
        for table in &self.settings.tables {
            conn.execute(&format!("ALTER TABLE {table} SCATTER;"))
                .with_context(|| format!("scatter {table}"))?;
        }

        self.cluster
            .wait_for_replication(self.settings.replication_factor)
            .context("wait for replication")?;

        for &node in &self.settings.servers {
            let mut conn = self
                .cluster
                .connect(node)
                .with_context(|| format!("connect to node {node}"))?;
            self.use_database(conn.as_mut())?;
            for table in &self.settings.tables {
                conn.execute(&format!("SELECT count(*) FROM {table};"))
                    .with_context(|| format!("warm {table} on node {node}"))?;
            }
        }
        Ok(())
    }

    // The last batch of a crashed level may still be running. Kill it and wait
    // for its thread before servers come back.
    fn clear_workload(&self) {
        let driver = self.settings.driver;
        if let Err(err) = self.workload.kill_stragglers(driver) {
            tracing::warn!(node = %driver, error = %err, "failed to kill leftover workload processes");
        }
        self.prober.reap();
    }

    fn restart(&self) -> anyhow::Result<()> {
        let servers = &self.settings.servers;
        self.cluster.stop(servers).context("stop servers")?;
        self.cluster.start(servers).context("start servers")?;
        Ok(())
    }

    fn use_database(&self, conn: &mut dyn concprobe_adapters::SqlConn) -> anyhow::Result<()> {
        if let Some(db) = &self.settings.database {
            conn.execute(&format!("USE {db};"))
                .with_context(|| format!("use database {db}"))?;
        }
        Ok(())
    }

    fn first_server(&self) -> anyhow::Result<NodeId> {
        self.settings
            .servers
            .first()
            .copied()
            .context("no server nodes configured")
    }
}
