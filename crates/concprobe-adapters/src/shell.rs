//! Cluster and workload adapters backed by configured shell commands.

use crate::cluster::{Cluster, ClusterError, SqlConn, WorkloadRunner};
use crate::template::{CommandTemplate, TemplateError, substitute};
use crate::{CommandSpec, DEFAULT_OUTPUT_CAP_BYTES, ProcessRunner, RunResult};
use concprobe_types::{ClusterCommands, NodeId, QueryId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ShellCommands {
    pub start: CommandTemplate,
    pub stop: CommandTemplate,
    pub run: CommandTemplate,
    pub sql: CommandTemplate,
    pub alive: CommandTemplate,
    pub replication: CommandTemplate,
}

impl ShellCommands {
    pub fn parse(cfg: &ClusterCommands) -> Result<Self, TemplateError> {
        Ok(Self {
            start: CommandTemplate::parse(&cfg.start)?,
            stop: CommandTemplate::parse(&cfg.stop)?,
            run: CommandTemplate::parse(&cfg.run)?,
            sql: CommandTemplate::parse(&cfg.sql)?,
            alive: CommandTemplate::parse(&cfg.alive)?,
            replication: CommandTemplate::parse(&cfg.replication)?,
        })
    }
}

const REPLICATION_WARN_EVERY: u64 = 60;

#[derive(Debug, Clone)]
pub struct ShellClusterOptions {
    pub artifacts_dir: PathBuf,

    /// Delay between replication checks.
    pub poll_interval: Duration,
    pub command_timeout: Option<Duration>,
    pub output_cap_bytes: usize,
}

impl Default for ShellClusterOptions {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from(concprobe_types::DEFAULT_ARTIFACTS_DIR),
            poll_interval: Duration::from_secs(1),
            command_timeout: None,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
        }
    }
}

pub struct ShellCluster<R: ProcessRunner> {
    runner: Arc<R>,
    commands: ShellCommands,
    options: ShellClusterOptions,
}

impl<R: ProcessRunner + 'static> ShellCluster<R> {
    pub fn new(runner: R, commands: ShellCommands, options: ShellClusterOptions) -> Self {
        Self {
            runner: Arc::new(runner),
            commands,
            options,
        }
    }

    fn spec(&self, argv: Vec<String>) -> CommandSpec {
        CommandSpec {
            argv,
            env: Vec::new(),
            timeout: self.options.command_timeout,
            output_cap_bytes: self.options.output_cap_bytes,
        }
    }

    fn run_checked(&self, argv: Vec<String>) -> Result<RunResult, ClusterError> {
        run_checked(self.runner.as_ref(), &self.spec(argv))
    }
}

fn run_checked<R: ProcessRunner + ?Sized>(
    runner: &R,
    spec: &CommandSpec,
) -> Result<RunResult, ClusterError> {
    let command = spec.argv.join(" ");
    tracing::debug!(%command, "running");
    let result = runner.run(spec)?;
    if result.timed_out {
        return Err(ClusterError::TimedOut { command });
    }
    if result.exit_code != 0 {
        return Err(ClusterError::CommandFailed {
            command,
            exit_code: result.exit_code,
            stderr: result.stderr_lossy().trim().to_string(),
        });
    }
    Ok(result)
}

fn join_nodes(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(NodeId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl<R: ProcessRunner + 'static> Cluster for ShellCluster<R> {
    fn start(&self, nodes: &[NodeId]) -> Result<(), ClusterError> {
        let nodes = join_nodes(nodes);
        self.run_checked(self.commands.start.render(&[("nodes", nodes.as_str())]))?;
        Ok(())
    }

    fn stop(&self, nodes: &[NodeId]) -> Result<(), ClusterError> {
        let nodes = join_nodes(nodes);
        self.run_checked(self.commands.stop.render(&[("nodes", nodes.as_str())]))?;
        Ok(())
    }

    fn execute(&self, node: NodeId, cmd: &str) -> Result<String, ClusterError> {
        let node = node.to_string();
        let result = self.run_checked(
            self.commands
                .run
                .render(&[("node", node.as_str()), ("cmd", cmd)]),
        )?;
        Ok(result.stdout_lossy())
    }

    fn connect(&self, node: NodeId) -> Result<Box<dyn SqlConn>, ClusterError> {
        Ok(Box::new(ShellSqlConn {
            runner: Arc::clone(&self.runner),
            template: self.commands.sql.clone(),
            node,
            timeout: self.options.command_timeout,
            output_cap_bytes: self.options.output_cap_bytes,
            session: Vec::new(),
        }))
    }

    fn dead_nodes(&self, nodes: &[NodeId]) -> Result<Vec<NodeId>, ClusterError> {
        let mut dead = Vec::new();
        for &node in nodes {
            let id = node.to_string();
            let spec = self.spec(self.commands.alive.render(&[("node", id.as_str())]));
            let result = self.runner.run(&spec)?;
            if !result.success() {
                dead.push(node);
            }
        }
        Ok(dead)
    }

    fn wait_for_replication(&self, min_copies: u32) -> Result<(), ClusterError> {
        let copies = min_copies.to_string();
        let spec = self.spec(self.commands.replication.render(&[("copies", copies.as_str())]));
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            let result = self.runner.run(&spec)?;
            if result.success() {
                return Ok(());
            }
            // The shell could not find or execute the check at all.
            if matches!(result.exit_code, 126 | 127) {
                return Err(ClusterError::CommandFailed {
                    command: spec.argv.join(" "),
                    exit_code: result.exit_code,
                    stderr: result.stderr_lossy().trim().to_string(),
                });
            }
            if attempt % REPLICATION_WARN_EVERY == 0 {
                tracing::warn!(min_copies, attempt, "still waiting for replication");
            } else {
                tracing::debug!(min_copies, attempt, "waiting for replication");
            }
            thread::sleep(self.options.poll_interval);
        }
    }

    fn artifacts_dir(&self) -> &Path {
        &self.options.artifacts_dir
    }
}

/// A SQL "session" over a stateless CLI.
///
/// Every statement runs in a fresh process, so session-scoped statements
/// (`USE`, `SET` other than `SET CLUSTER SETTING`) are remembered and
/// replayed ahead of each later statement.
pub struct ShellSqlConn<R: ProcessRunner> {
    runner: Arc<R>,
    template: CommandTemplate,
    node: NodeId,
    timeout: Option<Duration>,
    output_cap_bytes: usize,
    session: Vec<String>,
}

impl<R: ProcessRunner> ShellSqlConn<R> {
    fn script(&self, statement: &str) -> String {
        let mut parts: Vec<&str> = self.session.iter().map(String::as_str).collect();
        parts.push(statement);
        parts
            .iter()
            .map(|s| s.trim().trim_end_matches(';'))
            .filter(|s| !s.is_empty())
            .map(|s| format!("{s};"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn is_session_scoped(statement: &str) -> bool {
    let upper = statement.trim_start().to_ascii_uppercase();
    upper.starts_with("USE ")
        || (upper.starts_with("SET ") && !upper.starts_with("SET CLUSTER SETTING"))
}

impl<R: ProcessRunner> SqlConn for ShellSqlConn<R> {
    fn execute(&mut self, statement: &str) -> Result<(), ClusterError> {
        let node = self.node.to_string();
        let script = self.script(statement);
        let spec = CommandSpec {
            argv: self
                .template
                .render(&[("node", node.as_str()), ("statement", script.as_str())]),
            env: Vec::new(),
            timeout: self.timeout,
            output_cap_bytes: self.output_cap_bytes,
        };
        run_checked(self.runner.as_ref(), &spec)?;
        if is_session_scoped(statement) {
            self.session.push(statement.to_string());
        }
        Ok(())
    }
}

/// Workload batches launched on the driver node through [`Cluster::execute`].
pub struct ShellWorkload<C: Cluster + ?Sized> {
    cluster: Arc<C>,
    run: String,
    kill: String,
    servers: String,
}

impl<C: Cluster + ?Sized> ShellWorkload<C> {
    pub fn new(cluster: Arc<C>, run: String, kill: String, servers: &[NodeId]) -> Self {
        Self {
            cluster,
            run,
            kill,
            servers: join_nodes(servers),
        }
    }

    pub fn batch_command(&self, query: QueryId, concurrency: u32, max_ops: u32) -> String {
        let query = query.to_string();
        let concurrency = concurrency.to_string();
        let max_ops = max_ops.to_string();
        substitute(
            &self.run,
            &[
                ("query", query.as_str()),
                ("concurrency", concurrency.as_str()),
                ("max_ops", max_ops.as_str()),
                ("servers", self.servers.as_str()),
            ],
        )
    }
}

impl<C: Cluster + ?Sized> WorkloadRunner for ShellWorkload<C> {
    fn run_batch(
        &self,
        driver: NodeId,
        query: QueryId,
        concurrency: u32,
        max_ops: u32,
    ) -> Result<(), ClusterError> {
        let cmd = self.batch_command(query, concurrency, max_ops);
        self.cluster.execute(driver, &cmd)?;
        Ok(())
    }

    fn kill_stragglers(&self, driver: NodeId) -> Result<(), ClusterError> {
        self.cluster.execute(driver, &self.kill)?;
        Ok(())
    }
}
