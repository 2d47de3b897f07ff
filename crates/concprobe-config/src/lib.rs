//! Config loading for concprobe.
//!
//! A config file describes the cluster (as command templates), the workload,
//! and the search bracket. [`resolve`] applies CLI overrides, validates, and
//! parses durations so the rest of the tool never sees raw strings.

use anyhow::Context;
use concprobe_adapters::{CommandTemplate, ShellCommands, TemplateError};
use concprobe_types::{
    ConfigFile, DEFAULT_ARTIFACTS_DIR, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT, NodeId, SetupConfig,
    WorkloadConfig,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("min_concurrency must be at least 1")]
    ZeroMinConcurrency,

    #[error("min_concurrency ({min}) must be below max_concurrency ({max})")]
    InvalidBounds { min: u32, max: u32 },

    #[error("cluster.server_nodes must not be empty")]
    NoServers,

    #[error("node {0} is listed more than once in cluster.server_nodes")]
    DuplicateServer(NodeId),

    #[error("cluster.driver_node ({0}) must not be one of the server nodes")]
    DriverIsServer(NodeId),

    #[error("workload.queries must be at least 1")]
    NoQueries,

    #[error("setup.replication_factor must be at least 1")]
    ZeroReplicationFactor,

    #[error("{field} must not be empty")]
    EmptyCommand { field: &'static str },

    #[error("{field}: {source}")]
    Template {
        field: &'static str,
        #[source]
        source: TemplateError,
    },

    #[error("{field}: invalid duration {value:?}: {message}")]
    Duration {
        field: &'static str,
        value: String,
        message: String,
    },
}

/// CLI-level overrides, applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub min_concurrency: Option<u32>,
    pub max_concurrency: Option<u32>,
    pub artifacts_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub min_concurrency: u32,
    pub max_concurrency: u32,

    /// Whole-run deadline.
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub command_timeout: Option<Duration>,
    pub artifacts_dir: PathBuf,
    pub servers: Vec<NodeId>,
    pub driver: NodeId,
    pub commands: ShellCommands,
    pub workload: WorkloadConfig,
    pub setup: SetupConfig,
}

pub fn load_config(path: &Path) -> anyhow::Result<ConfigFile> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg = parse_config(&text).with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}

pub fn parse_config(text: &str) -> Result<ConfigFile, ConfigError> {
    Ok(toml::from_str(text)?)
}

pub fn resolve(mut cfg: ConfigFile, overrides: &Overrides) -> Result<ResolvedConfig, ConfigError> {
    if let Some(min) = overrides.min_concurrency {
        cfg.search.min_concurrency = min;
    }
    if let Some(max) = overrides.max_concurrency {
        cfg.search.max_concurrency = max;
    }

    validate(&cfg)?;

    let timeout = match overrides.timeout {
        Some(t) => t,
        None => parse_duration(
            "search.timeout",
            cfg.search.timeout.as_deref().unwrap_or(DEFAULT_TIMEOUT),
        )?,
    };
    let poll_interval = parse_duration(
        "cluster.poll_interval",
        cfg.cluster
            .poll_interval
            .as_deref()
            .unwrap_or(DEFAULT_POLL_INTERVAL),
    )?;
    let command_timeout = cfg
        .cluster
        .command_timeout
        .as_deref()
        .map(|s| parse_duration("cluster.command_timeout", s))
        .transpose()?;

    let artifacts_dir = overrides.artifacts_dir.clone().unwrap_or_else(|| {
        PathBuf::from(
            cfg.cluster
                .artifacts_dir
                .as_deref()
                .unwrap_or(DEFAULT_ARTIFACTS_DIR),
        )
    });

    let commands = ShellCommands::parse(&cfg.cluster.commands).map_err(|source| {
        ConfigError::Template {
            field: "cluster.commands",
            source,
        }
    })?;

    Ok(ResolvedConfig {
        min_concurrency: cfg.search.min_concurrency,
        max_concurrency: cfg.search.max_concurrency,
        timeout,
        poll_interval,
        command_timeout,
        artifacts_dir,
        servers: cfg.cluster.server_nodes,
        driver: cfg.cluster.driver_node,
        commands,
        workload: cfg.workload,
        setup: cfg.setup,
    })
}

pub fn validate(cfg: &ConfigFile) -> Result<(), ConfigError> {
    let (min, max) = (cfg.search.min_concurrency, cfg.search.max_concurrency);
    if min == 0 {
        return Err(ConfigError::ZeroMinConcurrency);
    }
    if min >= max {
        return Err(ConfigError::InvalidBounds { min, max });
    }

    if cfg.cluster.server_nodes.is_empty() {
        return Err(ConfigError::NoServers);
    }
    let mut seen = BTreeSet::new();
    for &node in &cfg.cluster.server_nodes {
        if !seen.insert(node) {
            return Err(ConfigError::DuplicateServer(node));
        }
    }
    if seen.contains(&cfg.cluster.driver_node) {
        return Err(ConfigError::DriverIsServer(cfg.cluster.driver_node));
    }

    if cfg.workload.queries == 0 {
        return Err(ConfigError::NoQueries);
    }
    if cfg.setup.replication_factor == 0 {
        return Err(ConfigError::ZeroReplicationFactor);
    }

    let commands = &cfg.cluster.commands;
    for (field, template) in [
        ("cluster.commands.start", &commands.start),
        ("cluster.commands.stop", &commands.stop),
        ("cluster.commands.run", &commands.run),
        ("cluster.commands.sql", &commands.sql),
        ("cluster.commands.alive", &commands.alive),
        ("cluster.commands.replication", &commands.replication),
    ] {
        CommandTemplate::parse(template)
            .map_err(|source| ConfigError::Template { field, source })?;
    }

    for (field, command) in [
        ("workload.run", &cfg.workload.run),
        ("workload.kill", &cfg.workload.kill),
    ] {
        if command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand { field });
        }
    }
    if let Some(load) = &cfg.setup.load {
        if load.trim().is_empty() {
            return Err(ConfigError::EmptyCommand { field: "setup.load" });
        }
    }

    Ok(())
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Duration {
        field,
        value: value.to_string(),
        message: e.to_string(),
    })
}
