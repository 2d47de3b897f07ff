use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use concprobe_adapters::{
    DEFAULT_OUTPUT_CAP_BYTES, ShellCluster, ShellClusterOptions, ShellWorkload, StdProcessRunner,
};
use concprobe_app::{
    ProbeSearchRequest, ProbeSearchUseCase, SearchOutcome, SearchSettings, SystemClock,
    render_markdown,
};
use concprobe_config::{Overrides, ResolvedConfig, load_config, resolve};
use concprobe_domain::{QueryCatalog, SearchInterval, max_ops_for};
use concprobe_types::{SearchReceipt, ToolInfo};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "concprobe",
    version,
    about = "Find the highest workload concurrency a cluster survives"
)]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bisect for the max supported concurrency and write stats.json.
    Run {
        /// Path to a TOML config
        #[arg(long)]
        config: PathBuf,

        /// Override the known-good lower bound
        #[arg(long)]
        min: Option<u32>,

        /// Override the assumed-bad upper bound
        #[arg(long)]
        max: Option<u32>,

        /// Directory stats.json is written to
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,

        /// Whole-run deadline (e.g. "18h")
        #[arg(long)]
        timeout: Option<String>,

        /// Also write the full search receipt here
        #[arg(long)]
        receipt: Option<PathBuf>,

        /// Pretty-print JSON
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },

    /// Render a Markdown summary from a search receipt.
    Md {
        #[arg(long)]
        receipt: PathBuf,

        /// Output markdown path (default: stdout)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the probe budget for a bracket without touching a cluster.
    Plan {
        #[arg(long, default_value_t = concprobe_types::DEFAULT_MIN_CONCURRENCY)]
        min: u32,

        #[arg(long, default_value_t = concprobe_types::DEFAULT_MAX_CONCURRENCY)]
        max: u32,
    },
}

fn main() -> ExitCode {
    if let Err(err) = real_main() {
        eprintln!("{err:#}");
        return ExitCode::from(1);
    }
    ExitCode::from(0)
}

fn real_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format)?;

    match cli.cmd {
        Command::Run {
            config,
            min,
            max,
            artifacts_dir,
            timeout,
            receipt,
            pretty,
        } => {
            let timeout = timeout.as_deref().map(parse_duration).transpose()?;

            let file = load_config(&config)?;
            let resolved = resolve(
                file,
                &Overrides {
                    min_concurrency: min,
                    max_concurrency: max,
                    artifacts_dir,
                    timeout,
                },
            )
            .with_context(|| format!("invalid config {}", config.display()))?;

            let deadline = resolved.timeout;
            let outcome = run_with_deadline(deadline, move || run_search(resolved))?;

            write_json(&outcome.stats_path, &outcome.stats, pretty)?;
            if let Some(path) = receipt {
                write_json(&path, &outcome.receipt, pretty)?;
            }
            println!("{}", outcome.stats.max_concurrency);
            Ok(())
        }

        Command::Md { receipt, out } => {
            let receipt: SearchReceipt = read_json(&receipt)?;
            let md = render_markdown(&receipt);

            match out {
                Some(path) => {
                    fs::write(&path, md).with_context(|| format!("write {}", path.display()))?;
                }
                None => {
                    print!("{md}");
                }
            }

            Ok(())
        }

        Command::Plan { min, max } => {
            let interval = SearchInterval::new(min, max)?;
            println!("bounds: [{min}, {max}]");
            println!("max probes: {}", interval.max_probes());
            match interval.midpoint() {
                Some(mid) => println!("first probe: {mid} (max ops {})", max_ops_for(mid)),
                None => println!("first probe: none, result is {min}"),
            }
            Ok(())
        }
    }
}

fn run_search(cfg: ResolvedConfig) -> anyhow::Result<SearchOutcome> {
    let catalog = QueryCatalog::new(cfg.workload.queries)?;

    let cluster = Arc::new(ShellCluster::new(
        StdProcessRunner,
        cfg.commands,
        ShellClusterOptions {
            artifacts_dir: cfg.artifacts_dir,
            poll_interval: cfg.poll_interval,
            command_timeout: cfg.command_timeout,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
        },
    ));
    let workload = Arc::new(ShellWorkload::new(
        Arc::clone(&cluster),
        cfg.workload.run,
        cfg.workload.kill,
        &cfg.servers,
    ));

    let settings = SearchSettings {
        servers: cfg.servers,
        driver: cfg.driver,
        poll_interval: cfg.poll_interval,
        catalog,
        workload_name: cfg.workload.name,
        database: cfg.workload.database,
        tables: cfg.workload.tables,
        setup_statements: cfg.setup.statements,
        load: cfg.setup.load,
        replication_factor: cfg.setup.replication_factor,
    };

    let usecase = ProbeSearchUseCase::new(cluster, workload, SystemClock, tool_info(), settings);
    usecase.execute(ProbeSearchRequest {
        min_concurrency: cfg.min_concurrency,
        max_concurrency: cfg.max_concurrency,
    })
}

/// Run `f` on a worker thread; give up once `timeout` elapses. The worker is
/// abandoned, and dies with the process.
fn run_with_deadline<T, F>(timeout: Duration, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("concprobe-search".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .context("spawn search thread")?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => anyhow::bail!(
            "search did not finish within {}",
            humantime::format_duration(timeout)
        ),
        Err(RecvTimeoutError::Disconnected) => {
            anyhow::bail!("search thread exited without a result")
        }
    }
}

fn init_logging(verbose: u8, format: LogFormat) -> anyhow::Result<()> {
    use std::io::IsTerminal;
    use tracing_subscriber::EnvFilter;

    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("init logging: {e}"))
}

fn tool_info() -> ToolInfo {
    ToolInfo {
        name: "concprobe".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let d = humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))?;
    Ok(d)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let v =
        serde_json::from_slice(&bytes).with_context(|| format!("parse json {}", path.display()))?;
    Ok(v)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, pretty: bool) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }

    let bytes = if pretty {
        serde_json::to_vec_pretty(value)?
    } else {
        serde_json::to_vec(value)?
    };

    atomic_write(path, &bytes)
}

// Readers never observe a half-written stats.json.
fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));

    {
        let mut f =
            fs::File::create(&tmp).with_context(|| format!("create temp {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write temp {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
