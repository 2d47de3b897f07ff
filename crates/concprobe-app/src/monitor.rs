//! Crash monitor: run tasks while watching a set of server processes.
//!
//! Tasks and the watcher each run on their own thread and report into one
//! channel; [`CrashMonitor::wait`] is the single blocking join. A node death
//! wins over whatever the tasks report, including success, and ends the wait
//! without waiting for busy tasks.

use concprobe_adapters::Cluster;
use concprobe_types::NodeId;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Raised once when the monitor stops. Tasks should check it between units
/// of work; threads are never killed.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, waking early if raised. Returns whether the
    /// signal is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitored node(s) {} died", join_nodes(.nodes))]
    NodeCrashed { nodes: Vec<NodeId> },

    #[error("monitored task failed: {0:#}")]
    Task(anyhow::Error),

    #[error("liveness check failed: {0:#}")]
    Watch(anyhow::Error),

    #[error("monitor has no tasks to wait for")]
    NoTasks,

    #[error("monitor already finished")]
    Finished,

    #[error("failed to spawn monitor thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl MonitorError {
    /// True for outcomes that say the cluster could not sustain the load.
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            MonitorError::NodeCrashed { .. } | MonitorError::Task(_) | MonitorError::Watch(_)
        )
    }
}

fn join_nodes(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(NodeId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Completed,
    TaskFailed,
    Crashed,
}

impl MonitorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MonitorState::Completed | MonitorState::TaskFailed | MonitorState::Crashed
        )
    }
}

enum Event {
    TaskDone(anyhow::Result<()>),
    NodesDead(Vec<NodeId>),
    WatchFailed(anyhow::Error),
}

/// Task threads still running when a [`CrashMonitor::wait`] failed. They
/// have seen the stop signal and exit after their current unit of work.
#[derive(Debug, Default)]
pub struct Lingering {
    handles: Vec<JoinHandle<()>>,
}

impl Lingering {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn absorb(&mut self, other: Lingering) {
        self.handles.extend(other.handles);
    }

    /// Block until every thread has exited. Returns how many there were.
    pub fn join(self) -> usize {
        let n = self.handles.len();
        for handle in self.handles {
            // Task panics were already caught and reported as errors.
            let _ = handle.join();
        }
        n
    }
}

/// One monitor per probe. Read-only toward the cluster: it only ever asks
/// which nodes are dead.
pub struct CrashMonitor<C: Cluster + ?Sized + 'static> {
    cluster: Arc<C>,
    nodes: Vec<NodeId>,
    poll_interval: Duration,
    stop: StopSignal,
    tx: Sender<Event>,
    rx: Receiver<Event>,
    tasks: Vec<JoinHandle<()>>,
    lingering: Lingering,
    watcher: Option<JoinHandle<()>>,
    state: MonitorState,
}

impl<C: Cluster + ?Sized + 'static> CrashMonitor<C> {
    /// Bind to `nodes`. Nothing runs until the first [`spawn`](Self::spawn).
    pub fn attach(cluster: Arc<C>, nodes: &[NodeId], poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            cluster,
            nodes: nodes.to_vec(),
            poll_interval,
            stop: StopSignal::new(),
            tx,
            rx,
            tasks: Vec::new(),
            lingering: Lingering::default(),
            watcher: None,
            state: MonitorState::Idle,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Tasks a failed [`wait`](Self::wait) left running. Empty after a
    /// successful wait.
    pub fn take_lingering(&mut self) -> Lingering {
        std::mem::take(&mut self.lingering)
    }

    /// Schedule `task` to run concurrently with supervision. The first call
    /// also starts the watcher.
    pub fn spawn<F>(&mut self, task: F) -> Result<(), MonitorError>
    where
        F: FnOnce(StopSignal) -> anyhow::Result<()> + Send + 'static,
    {
        if self.state.is_terminal() {
            return Err(MonitorError::Finished);
        }
        if self.watcher.is_none() {
            self.watcher = Some(self.start_watcher()?);
        }

        let tx = self.tx.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(format!("concprobe-task-{}", self.tasks.len()))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| task(stop)))
                    .unwrap_or_else(|payload| Err(panic_error(payload)));
                // The monitor may already have returned.
                let _ = tx.send(Event::TaskDone(result));
            })
            .map_err(MonitorError::Spawn)?;

        self.tasks.push(handle);
        self.state = MonitorState::Running;
        Ok(())
    }

    fn start_watcher(&self) -> Result<JoinHandle<()>, MonitorError> {
        let cluster = Arc::clone(&self.cluster);
        let nodes = self.nodes.clone();
        let poll = self.poll_interval;
        let stop = self.stop.clone();
        let tx = self.tx.clone();

        thread::Builder::new()
            .name("concprobe-watcher".to_string())
            .spawn(move || {
                loop {
                    match cluster.dead_nodes(&nodes) {
                        Ok(dead) if !dead.is_empty() => {
                            let _ = tx.send(Event::NodesDead(dead));
                            return;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            let _ = tx.send(Event::WatchFailed(err.into()));
                            return;
                        }
                    }
                    if stop.wait_timeout(poll) {
                        return;
                    }
                }
            })
            .map_err(MonitorError::Spawn)
    }

    /// Block until every task finished or a node died, whichever happens
    /// first. A node death observed at any point before returning is
    /// reported as [`MonitorError::NodeCrashed`], even if the tasks succeeded.
    ///
    /// The stop signal is raised before returning. On failure, tasks still
    /// busy are not waited for; they move to [`take_lingering`](Self::take_lingering).
    pub fn wait(&mut self) -> Result<(), MonitorError> {
        match self.state {
            MonitorState::Idle => return Err(MonitorError::NoTasks),
            MonitorState::Running => {}
            _ => return Err(MonitorError::Finished),
        }

        let mut remaining = self.tasks.len();
        let result = loop {
            let Ok(event) = self.rx.recv() else {
                break Err(MonitorError::Task(anyhow::anyhow!(
                    "monitor channel closed unexpectedly"
                )));
            };
            match event {
                Event::NodesDead(nodes) => break Err(MonitorError::NodeCrashed { nodes }),
                Event::WatchFailed(err) => break Err(MonitorError::Watch(err)),
                Event::TaskDone(Err(err)) => break self.recheck(Err(MonitorError::Task(err))),
                Event::TaskDone(Ok(())) => {
                    remaining -= 1;
                    if remaining == 0 {
                        break self.recheck(Ok(()));
                    }
                }
            }
        };

        self.finish(result.is_ok());
        self.state = match &result {
            Ok(()) => MonitorState::Completed,
            Err(MonitorError::Task(_)) => MonitorState::TaskFailed,
            Err(_) => MonitorState::Crashed,
        };
        result
    }

    // The watcher may not have polled since the node died.
    fn recheck(&self, tasks: Result<(), MonitorError>) -> Result<(), MonitorError> {
        match self.cluster.dead_nodes(&self.nodes) {
            Ok(dead) if !dead.is_empty() => Err(MonitorError::NodeCrashed { nodes: dead }),
            Ok(_) => tasks,
            Err(err) => Err(MonitorError::Watch(err.into())),
        }
    }

    fn finish(&mut self, completed: bool) {
        self.stop.raise();
        if let Some(watcher) = self.watcher.take() {
            if watcher.join().is_err() {
                tracing::warn!("crash monitor watcher panicked");
            }
        }

        // After success every task has reported, so joining is immediate.
        let (done, busy): (Vec<_>, Vec<_>) = self
            .tasks
            .drain(..)
            .partition(|task| completed || task.is_finished());
        for task in done {
            let _ = task.join();
        }
        if !busy.is_empty() {
            tracing::debug!(tasks = busy.len(), "leaving busy tasks behind");
        }
        self.lingering = Lingering { handles: busy };
    }
}

impl<C: Cluster + ?Sized + 'static> Drop for CrashMonitor<C> {
    fn drop(&mut self) {
        self.stop.raise();
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("task panicked: {msg}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use concprobe_fake::FakeCluster;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    const SERVERS: [NodeId; 3] = [NodeId(1), NodeId(2), NodeId(3)];

    fn running_cluster() -> Arc<FakeCluster> {
        let c = Arc::new(FakeCluster::new());
        c.start(&SERVERS).unwrap();
        c
    }

    fn monitor(cluster: &Arc<FakeCluster>, poll: Duration) -> CrashMonitor<FakeCluster> {
        CrashMonitor::attach(Arc::clone(cluster), &SERVERS, poll)
    }

    #[test]
    fn attach_has_no_side_effects() {
        let c = running_cluster();
        c.clear_events();
        let m = monitor(&c, Duration::from_millis(1));
        assert_eq!(m.state(), MonitorState::Idle);
        assert!(c.events().is_empty());
    }

    #[test]
    fn wait_without_tasks_is_an_error() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(1));
        assert!(matches!(m.wait(), Err(MonitorError::NoTasks)));
    }

    #[test]
    fn successful_tasks_complete() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(5));
        m.spawn(|_| Ok(())).unwrap();
        m.spawn(|_| {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        })
        .unwrap();
        assert_eq!(m.state(), MonitorState::Running);

        m.wait().unwrap();
        assert_eq!(m.state(), MonitorState::Completed);
    }

    #[test]
    fn task_error_is_reported() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(5));
        m.spawn(|_| Err(anyhow::anyhow!("query 7 failed"))).unwrap();

        let err = m.wait().unwrap_err();
        assert!(matches!(err, MonitorError::Task(_)), "got {err:?}");
        assert!(err.to_string().contains("query 7 failed"));
        assert_eq!(m.state(), MonitorState::TaskFailed);
    }

    #[test]
    fn crash_during_task_stops_the_task() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(5));
        let victim = Arc::clone(&c);
        m.spawn(move |stop| {
            victim.kill_node(NodeId(2));
            while !stop.wait_timeout(Duration::from_millis(5)) {}
            Ok(())
        })
        .unwrap();

        let started = Instant::now();
        let err = m.wait().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            MonitorError::NodeCrashed { nodes } => assert_eq!(nodes, vec![NodeId(2)]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(m.state(), MonitorState::Crashed);
    }

    #[test]
    fn crash_returns_while_task_is_still_busy() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(5));
        let victim = Arc::clone(&c);
        // Never looks at the stop signal.
        m.spawn(move |_| {
            victim.kill_node(NodeId(2));
            thread::sleep(Duration::from_secs(3));
            Ok(())
        })
        .unwrap();

        let started = Instant::now();
        let err = m.wait().unwrap_err();
        let took = started.elapsed();
        assert!(
            matches!(err, MonitorError::NodeCrashed { ref nodes } if nodes == &[NodeId(2)]),
            "got {err:?}"
        );
        assert!(
            took < Duration::from_millis(500),
            "wait blocked {took:?} after the crash"
        );

        let lingering = m.take_lingering();
        assert_eq!(lingering.len(), 1);
        assert!(m.take_lingering().is_empty());
    }

    #[test]
    fn task_error_does_not_wait_for_sibling_tasks() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(5));
        m.spawn(|_| {
            thread::sleep(Duration::from_secs(3));
            Ok(())
        })
        .unwrap();
        m.spawn(|_| Err(anyhow::anyhow!("query 3 failed"))).unwrap();

        let started = Instant::now();
        let err = m.wait().unwrap_err();
        assert!(matches!(err, MonitorError::Task(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!m.take_lingering().is_empty());
    }

    #[test]
    fn lingering_tasks_can_be_joined() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(5));
        let victim = Arc::clone(&c);
        let saw_stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&saw_stop);
        m.spawn(move |stop| {
            victim.kill_node(NodeId(1));
            thread::sleep(Duration::from_millis(50));
            seen.store(stop.is_raised(), Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        assert!(m.wait().is_err());
        assert_eq!(m.take_lingering().join(), 1);
        assert!(saw_stop.load(Ordering::SeqCst));
    }

    #[test]
    fn success_leaves_nothing_behind() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(5));
        m.spawn(|_| Ok(())).unwrap();
        m.wait().unwrap();
        assert!(m.take_lingering().is_empty());
    }

    #[test]
    fn death_just_before_success_is_a_crash() {
        let c = running_cluster();
        // Long enough that the watcher never polls after its first check.
        let mut m = monitor(&c, Duration::from_secs(3600));
        let victim = Arc::clone(&c);
        m.spawn(move |_| {
            thread::sleep(Duration::from_millis(30));
            victim.kill_node(NodeId(3));
            thread::sleep(Duration::from_millis(10));
            Ok(())
        })
        .unwrap();

        let err = m.wait().unwrap_err();
        assert!(
            matches!(err, MonitorError::NodeCrashed { ref nodes } if nodes == &[NodeId(3)]),
            "got {err:?}"
        );
        assert_eq!(m.state(), MonitorState::Crashed);
    }

    #[test]
    fn crash_takes_precedence_over_task_error() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_secs(3600));
        let victim = Arc::clone(&c);
        m.spawn(move |_| {
            thread::sleep(Duration::from_millis(20));
            victim.kill_node(NodeId(1));
            Err(anyhow::anyhow!("connection refused"))
        })
        .unwrap();

        assert!(matches!(m.wait(), Err(MonitorError::NodeCrashed { .. })));
    }

    #[test]
    fn failing_liveness_check_is_reported() {
        let c = running_cluster();
        c.fail_liveness_checks(true);
        let mut m = monitor(&c, Duration::from_millis(5));
        m.spawn(|stop| {
            stop.wait_timeout(Duration::from_secs(5));
            Ok(())
        })
        .unwrap();

        let err = m.wait().unwrap_err();
        assert!(matches!(err, MonitorError::Watch(_)), "got {err:?}");
        assert!(err.is_crash());
    }

    #[test]
    fn panicking_task_is_a_task_error() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(5));
        m.spawn(|_| panic!("boom")).unwrap();

        let err = m.wait().unwrap_err();
        assert!(err.to_string().contains("boom"), "got {err}");
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        let c = running_cluster();
        let mut m = monitor(&c, Duration::from_millis(5));
        m.spawn(|_| Ok(())).unwrap();
        m.wait().unwrap();

        assert!(matches!(m.spawn(|_| Ok(())), Err(MonitorError::Finished)));
        assert!(matches!(m.wait(), Err(MonitorError::Finished)));
        assert_eq!(m.state(), MonitorState::Completed);
    }

    #[test]
    fn monitor_never_touches_processes() {
        let c = running_cluster();
        c.clear_events();
        let mut m = monitor(&c, Duration::from_millis(1));
        m.spawn(|_| {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        })
        .unwrap();
        m.wait().unwrap();
        assert!(c.events().is_empty());
        assert_eq!(c.running_nodes(), SERVERS.to_vec());
    }

    #[test]
    fn stop_signal_wakes_waiters() {
        let stop = StopSignal::new();
        assert!(!stop.wait_timeout(Duration::from_millis(1)));

        let waiter = stop.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(10));
        stop.raise();
        assert!(handle.join().unwrap());
        assert!(stop.is_raised());
    }
}
