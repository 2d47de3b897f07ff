//! Shared types for concprobe.
//!
//! Design goal: versioned, explicit, boring.
//! These structs are the stats artifact consumed by dashboards, the search
//! receipt kept for humans, and the config file schema.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SEARCH_SCHEMA_V1: &str = "concprobe.search.v1";

/// File name of the stats artifact inside the artifacts directory.
pub const STATS_FILE_NAME: &str = "stats.json";

pub const DEFAULT_MIN_CONCURRENCY: u32 = 32;
pub const DEFAULT_MAX_CONCURRENCY: u32 = 192;
pub const DEFAULT_TIMEOUT: &str = "18h";
pub const DEFAULT_POLL_INTERVAL: &str = "1s";
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";
pub const DEFAULT_REPLICATION_FACTOR: u32 = 3;
pub const TPCH_QUERY_COUNT: u32 = 22;

/// A cluster node, numbered from 1.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A workload query identifier, numbered from 1.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct QueryId(pub u32);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Survived,
    Crashed,
}

impl ProbeStatus {
    pub fn is_survived(self) -> bool {
        matches!(self, ProbeStatus::Survived)
    }
}

/// The stats artifact. Serializes as `{ "max_concurrency": N }` and nothing else.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MaxConcurrencyStats {
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RunMeta {
    pub id: String,
    pub started_at: String,
    pub ended_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct WorkloadMeta {
    pub name: String,
    pub queries: u32,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SearchBounds {
    pub min_concurrency: u32,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ProbeRecord {
    pub concurrency: u32,
    pub max_ops: u32,
    pub status: ProbeStatus,

    /// Why the probe was classified as crashed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Interval after folding this probe in.
    pub after: SearchBounds,

    pub wall_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SearchReceipt {
    pub schema: String,
    pub tool: ToolInfo,
    pub run: RunMeta,
    pub workload: WorkloadMeta,
    pub initial: SearchBounds,
    pub probes: Vec<ProbeRecord>,
    pub result: MaxConcurrencyStats,
}

// ----------------------------
// Config file schema
// ----------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub search: SearchConfig,

    pub cluster: ClusterConfig,

    pub workload: WorkloadConfig,

    #[serde(default)]
    pub setup: SetupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SearchConfig {
    /// Known-good lower bound.
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: u32,

    /// Assumed-bad upper bound. Never verified.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Whole-run deadline, parseable by humantime, e.g. "18h".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_concurrency: DEFAULT_MIN_CONCURRENCY,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ClusterConfig {
    pub server_nodes: Vec<NodeId>,

    /// Node the workload generator runs on.
    pub driver_node: NodeId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<String>,

    /// Liveness and replication polling interval, e.g. "1s".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,

    /// Optional per-command timeout, e.g. "2h".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout: Option<String>,

    pub commands: ClusterCommands,
}

/// Command templates. Split with shell rules, then placeholders are
/// substituted per argument.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ClusterCommands {
    /// Placeholders: `{nodes}`.
    pub start: String,

    /// Placeholders: `{nodes}`.
    pub stop: String,

    /// Placeholders: `{node}`, `{cmd}`.
    pub run: String,

    /// Placeholders: `{node}`, `{statement}`.
    pub sql: String,

    /// Exits zero while the server process on `{node}` is alive.
    pub alive: String,

    /// Exits zero once every range has at least `{copies}` replicas.
    pub replication: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WorkloadConfig {
    pub name: String,

    #[serde(default = "default_query_count")]
    pub queries: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    #[serde(default)]
    pub tables: Vec<String>,

    /// Shell command run on the driver node. Placeholders: `{query}`,
    /// `{concurrency}`, `{max_ops}`, `{servers}`.
    pub run: String,

    /// Shell command run on the driver node to kill leftover workers.
    pub kill: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SetupConfig {
    /// Statements run once on the first server before searching.
    #[serde(default)]
    pub statements: Vec<String>,

    /// Data load command run once on the driver node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<String>,

    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            statements: Vec::new(),
            load: None,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
        }
    }
}

fn default_min_concurrency() -> u32 {
    DEFAULT_MIN_CONCURRENCY
}

fn default_max_concurrency() -> u32 {
    DEFAULT_MAX_CONCURRENCY
}

fn default_query_count() -> u32 {
    TPCH_QUERY_COUNT
}

fn default_replication_factor() -> u32 {
    DEFAULT_REPLICATION_FACTOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_artifact_has_exactly_one_key() {
        let stats = MaxConcurrencyStats {
            max_concurrency: 100,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, r#"{"max_concurrency":100}"#);
    }

    #[test]
    fn stats_artifact_parses_spaced_form() {
        let stats: MaxConcurrencyStats =
            serde_json::from_str(r#"{ "max_concurrency": 77 }"#).unwrap();
        assert_eq!(stats.max_concurrency, 77);
    }

    #[test]
    fn probe_status_serde_is_snake_case() {
        let json = serde_json::to_string(&ProbeStatus::Crashed).unwrap();
        assert_eq!(json, "\"crashed\"");
    }

    #[test]
    fn node_id_is_transparent() {
        let nodes: Vec<NodeId> = serde_json::from_str("[1,2,3]").unwrap();
        assert_eq!(nodes, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(NodeId(4).to_string(), "4");
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: ConfigFile = toml::from_str(
            r#"
            [cluster]
            server_nodes = [1, 2, 3]
            driver_node = 4

            [cluster.commands]
            start = "start {nodes}"
            stop = "stop {nodes}"
            run = "run {node} {cmd}"
            sql = "sql {node} {statement}"
            alive = "alive {node}"
            replication = "repl {copies}"

            [workload]
            name = "tpch"
            run = "workload --queries={query}"
            kill = "killall workload"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.search.min_concurrency, DEFAULT_MIN_CONCURRENCY);
        assert_eq!(cfg.search.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(cfg.workload.queries, TPCH_QUERY_COUNT);
        assert_eq!(cfg.setup.replication_factor, DEFAULT_REPLICATION_FACTOR);
        assert!(cfg.setup.statements.is_empty());
        assert_eq!(cfg.cluster.driver_node, NodeId(4));
    }
}
