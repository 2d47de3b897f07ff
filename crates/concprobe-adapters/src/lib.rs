//! Std adapters for concprobe.
//!
//! In clean-arch terms: this is where we touch the world. Everything the
//! search needs from a cluster goes through the traits in [`cluster`]; the
//! shell implementations drive a real cluster through configured command
//! templates run by a [`ProcessRunner`].

pub mod cluster;
mod shell;
mod template;

pub use cluster::{Cluster, ClusterError, SqlConn, WorkloadRunner};
pub use shell::{ShellCluster, ShellClusterOptions, ShellCommands, ShellSqlConn, ShellWorkload};
pub use template::{CommandTemplate, TemplateError};

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default cap on captured stdout/stderr per command.
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 64 * 1024;

const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub output_cap_bytes: usize,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            env: Vec::new(),
            timeout: None,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub wall_ms: u64,

    /// -1 when the process was terminated by a signal.
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("command argv must not be empty")]
    EmptyArgv,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait ProcessRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError>;
}

#[derive(Debug, Default, Clone)]
pub struct StdProcessRunner;

impl ProcessRunner for StdProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(AdapterError::EmptyArgv);
        };

        let start = Instant::now();

        let mut child = Command::new(program)
            .args(args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| AdapterError::Spawn {
                program: program.clone(),
                source,
            })?;

        let cap = spec.output_cap_bytes;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdout of {program} was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("stderr of {program} was not captured"))?;
        let out_handle = thread::spawn(move || read_capped(stdout, cap));
        let err_handle = thread::spawn(move || read_capped(stderr, cap));

        let (status, timed_out) =
            wait_with_deadline(&mut child, spec.timeout).map_err(|source| AdapterError::Wait {
                program: program.clone(),
                source,
            })?;

        let stdout = out_handle.join().unwrap_or_default();
        let stderr = err_handle.join().unwrap_or_default();

        Ok(RunResult {
            wall_ms: start.elapsed().as_millis() as u64,
            exit_code: status.code().unwrap_or(-1),
            timed_out,
            stdout,
            stderr,
        })
    }
}

/// Keep the first `cap` bytes and drain the rest so the child never blocks
/// on a full pipe.
fn read_capped<R: Read>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = reader.by_ref().take(cap as u64).read_to_end(&mut buf);
    let _ = io::copy(&mut reader, &mut io::sink());
    buf
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> io::Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return child.wait().map(|s| (s, false));
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if start.elapsed() >= timeout {
            // The child may exit between try_wait and kill.
            let _ = child.kill();
            return child.wait().map(|s| (s, true));
        }
        thread::sleep(WAIT_POLL);
    }
}
