//! One probe: the whole query catalog at one concurrency, under one monitor.

use crate::monitor::{CrashMonitor, Lingering, MonitorError};
use anyhow::Context;
use concprobe_adapters::{Cluster, WorkloadRunner};
use concprobe_domain::{QueryCatalog, max_ops_for};
use concprobe_types::{NodeId, ProbeStatus};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug)]
pub enum ProbeOutcome {
    Survived,
    Crashed(MonitorError),
}

impl ProbeOutcome {
    pub fn status(&self) -> ProbeStatus {
        match self {
            ProbeOutcome::Survived => ProbeStatus::Survived,
            ProbeOutcome::Crashed(_) => ProbeStatus::Crashed,
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            ProbeOutcome::Survived => None,
            ProbeOutcome::Crashed(err) => Some(err.to_string()),
        }
    }
}

pub struct ConcurrencyProber<C, W>
where
    C: Cluster + ?Sized + 'static,
    W: WorkloadRunner + ?Sized + 'static,
{
    cluster: Arc<C>,
    workload: Arc<W>,
    servers: Vec<NodeId>,
    driver: NodeId,
    catalog: QueryCatalog,
    poll_interval: Duration,
    lingering: Mutex<Lingering>,
}

impl<C, W> ConcurrencyProber<C, W>
where
    C: Cluster + ?Sized + 'static,
    W: WorkloadRunner + ?Sized + 'static,
{
    pub fn new(
        cluster: Arc<C>,
        workload: Arc<W>,
        servers: Vec<NodeId>,
        driver: NodeId,
        catalog: QueryCatalog,
        poll_interval: Duration,
    ) -> Self {
        Self {
            cluster,
            workload,
            servers,
            driver,
            catalog,
            poll_interval,
            lingering: Mutex::default(),
        }
    }

    /// Run every catalog query at `concurrency`.
    ///
    /// The cluster must be freshly reset. A node death or a failed batch is a
    /// [`ProbeOutcome::Crashed`]; `Err` is reserved for local failures such
    /// as being unable to start a thread.
    ///
    /// A crash returns as soon as it is seen. The batch in flight keeps
    /// running on the driver; its thread is kept for [`reap`](Self::reap).
    pub fn probe(&self, concurrency: u32) -> anyhow::Result<ProbeOutcome> {
        tracing::info!("running with concurrency = {concurrency}");

        let max_ops = max_ops_for(concurrency);
        let workload = Arc::clone(&self.workload);
        let catalog = self.catalog.clone();
        let driver = self.driver;

        let mut monitor =
            CrashMonitor::attach(Arc::clone(&self.cluster), &self.servers, self.poll_interval);
        monitor
            .spawn(move |stop| {
                for query in catalog.iter() {
                    if stop.is_raised() {
                        break;
                    }
                    tracing::debug!(%query, concurrency, max_ops, "running query");
                    workload
                        .run_batch(driver, query, concurrency, max_ops)
                        .with_context(|| format!("query {query} at concurrency {concurrency}"))?;
                }
                Ok(())
            })
            .context("start probe")?;

        let result = monitor.wait();
        self.lingering
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .absorb(monitor.take_lingering());

        match result {
            Ok(()) => Ok(ProbeOutcome::Survived),
            Err(err) if err.is_crash() => {
                tracing::warn!(concurrency, error = %err, "probe crashed");
                Ok(ProbeOutcome::Crashed(err))
            }
            Err(err) => Err(err).context("wait for probe"),
        }
    }

    /// Wait for task threads that earlier crashes left behind. Call after
    /// the workload processes were killed, so their last batch returns.
    pub fn reap(&self) -> usize {
        let lingering = std::mem::take(
            &mut *self
                .lingering
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if lingering.is_empty() {
            return 0;
        }
        tracing::debug!(tasks = lingering.len(), "joining leftover workload tasks");
        lingering.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concprobe_fake::{Capacity, FakeCluster, FakeWorkload};
    use concprobe_types::QueryId;
    use std::time::Instant;

    const SERVERS: [NodeId; 3] = [NodeId(1), NodeId(2), NodeId(3)];
    const DRIVER: NodeId = NodeId(4);

    fn setup(capacity: Capacity) -> (Arc<FakeCluster>, Arc<FakeWorkload>) {
        let cluster = Arc::new(FakeCluster::new());
        cluster.start(&SERVERS).unwrap();
        let workload = Arc::new(FakeWorkload::new(Arc::clone(&cluster), capacity));
        (cluster, workload)
    }

    fn prober(
        cluster: &Arc<FakeCluster>,
        workload: &Arc<FakeWorkload>,
    ) -> ConcurrencyProber<FakeCluster, FakeWorkload> {
        ConcurrencyProber::new(
            Arc::clone(cluster),
            Arc::clone(workload),
            SERVERS.to_vec(),
            DRIVER,
            QueryCatalog::tpch(),
            Duration::from_millis(2),
        )
    }

    #[test]
    fn survives_and_runs_catalog_in_order() {
        let (cluster, workload) = setup(Capacity::Unlimited);
        let outcome = prober(&cluster, &workload).probe(112).unwrap();

        assert_eq!(outcome.status(), ProbeStatus::Survived);
        assert!(outcome.reason().is_none());

        let batches = workload.batches();
        let queries: Vec<QueryId> = batches.iter().map(|b| b.query).collect();
        assert_eq!(queries, (1..=22).map(QueryId).collect::<Vec<_>>());
        assert!(
            batches
                .iter()
                .all(|b| b.driver == DRIVER && b.concurrency == 112 && b.max_ops == 11)
        );
    }

    #[test]
    fn node_death_is_a_crash() {
        let (cluster, workload) = setup(Capacity::CrashAbove {
            threshold: 100,
            victim: NodeId(2),
        });
        let outcome = prober(&cluster, &workload).probe(101).unwrap();

        assert_eq!(outcome.status(), ProbeStatus::Crashed);
        assert!(matches!(
            outcome,
            ProbeOutcome::Crashed(MonitorError::NodeCrashed { .. })
        ));
        assert!(outcome.reason().unwrap().contains('2'));
    }

    #[test]
    fn batch_failure_is_a_crash() {
        let (cluster, workload) = setup(Capacity::FailAbove { threshold: 50 });
        let outcome = prober(&cluster, &workload).probe(51).unwrap();

        assert!(matches!(outcome, ProbeOutcome::Crashed(MonitorError::Task(_))));
        assert!(outcome.reason().unwrap().contains("query 1"));
        // The first failing batch ends the catalog.
        assert_eq!(workload.batches().len(), 1);
        assert!(cluster.dead_nodes(&SERVERS).unwrap().is_empty());
    }

    #[test]
    fn liveness_failure_is_a_crash() {
        let (cluster, workload) = setup(Capacity::Unlimited);
        cluster.fail_liveness_checks(true);
        let outcome = prober(&cluster, &workload).probe(40).unwrap();
        assert_eq!(outcome.status(), ProbeStatus::Crashed);
    }

    #[test]
    fn crash_does_not_wait_for_the_batch_in_flight() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.start(&SERVERS).unwrap();
        let workload = Arc::new(
            FakeWorkload::new(
                Arc::clone(&cluster),
                Capacity::CrashAbove {
                    threshold: 100,
                    victim: NodeId(2),
                },
            )
            .with_hang_after_crash(Duration::from_secs(2)),
        );
        let p = prober(&cluster, &workload);

        let started = Instant::now();
        let outcome = p.probe(101).unwrap();
        let took = started.elapsed();
        assert_eq!(outcome.status(), ProbeStatus::Crashed);
        assert!(took < Duration::from_secs(1), "probe blocked {took:?}");

        // The leftover task sees the stop signal and runs no further batch.
        assert_eq!(p.reap(), 1);
        assert_eq!(workload.batches().len(), 1);
        assert_eq!(p.reap(), 0);
    }

    #[test]
    fn survived_level_leaves_nothing_to_reap() {
        let (cluster, workload) = setup(Capacity::Unlimited);
        let p = prober(&cluster, &workload);
        p.probe(40).unwrap();
        assert_eq!(p.reap(), 0);
    }

    #[test]
    fn small_concurrency_still_caps_operations() {
        let (cluster, workload) = setup(Capacity::Unlimited);
        prober(&cluster, &workload).probe(5).unwrap();
        assert!(workload.batches().iter().all(|b| b.max_ops == 1));
    }
}
