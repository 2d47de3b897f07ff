use anyhow::Context;
use clap::{Parser, Subcommand};
use schemars::schema_for;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "xtask", about = "Repo automation for concprobe")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// (Re)generate JSON Schemas for the stats artifact, receipts and config.
    Schema {
        /// Output directory
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },

    /// Load and resolve every shipped config.
    Configs {
        #[arg(long, default_value = "configs")]
        dir: PathBuf,
    },

    /// Run the "usual" repo checks (fmt, clippy, test, configs, schema).
    Ci,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Schema { out_dir } => cmd_schema(&out_dir),
        Command::Configs { dir } => cmd_configs(&dir),
        Command::Ci => cmd_ci(),
    }
}

fn cmd_ci() -> anyhow::Result<()> {
    run("cargo", ["fmt", "--all", "--", "--check"])?;
    run(
        "cargo",
        ["clippy", "--all-targets", "--all-features", "--", "-D", "warnings"],
    )?;
    run("cargo", ["test", "--all"])?;
    cmd_configs(Path::new("configs"))?;
    cmd_schema(Path::new("schemas"))?;
    Ok(())
}

fn run<const N: usize>(bin: &str, args: [&str; N]) -> anyhow::Result<()> {
    let status = std::process::Command::new(bin)
        .args(args)
        .status()
        .with_context(|| format!("running {bin}"))?;
    if !status.success() {
        anyhow::bail!("{bin} failed: {status}");
    }
    Ok(())
}

fn cmd_configs(dir: &Path) -> anyhow::Result<()> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    if paths.is_empty() {
        anyhow::bail!("no configs found in {}", dir.display());
    }

    for path in &paths {
        let cfg = concprobe_config::load_config(path)?;
        let resolved = concprobe_config::resolve(cfg, &concprobe_config::Overrides::default())
            .with_context(|| format!("invalid config {}", path.display()))?;
        println!(
            "ok {} [{}, {}] {} queries",
            path.display(),
            resolved.min_concurrency,
            resolved.max_concurrency,
            resolved.workload.queries
        );
    }
    Ok(())
}

fn cmd_schema(out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("create dir {}", out_dir.display()))?;

    write_schema(
        out_dir,
        "concprobe.stats.v1.schema.json",
        schema_for!(concprobe_types::MaxConcurrencyStats),
    )?;

    write_schema(
        out_dir,
        "concprobe.search.v1.schema.json",
        schema_for!(concprobe_types::SearchReceipt),
    )?;

    write_schema(
        out_dir,
        "concprobe.config.v1.schema.json",
        schema_for!(concprobe_types::ConfigFile),
    )?;

    Ok(())
}

fn write_schema<T: serde::Serialize>(out_dir: &Path, name: &str, schema: T) -> anyhow::Result<()> {
    let path = out_dir.join(name);
    let json = serde_json::to_vec_pretty(&schema)?;
    fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
