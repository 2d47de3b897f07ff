//! Application layer for concprobe.
//!
//! The app layer coordinates adapters and domain logic.
//! It does not parse CLI flags and it does not do filesystem I/O.

pub mod monitor;
pub mod prober;
mod search;

pub use monitor::{CrashMonitor, Lingering, MonitorError, MonitorState, StopSignal};
pub use prober::{ConcurrencyProber, ProbeOutcome};
pub use search::{ProbeSearchRequest, ProbeSearchUseCase, SearchOutcome, SearchSettings};

use concprobe_types::{ProbeStatus, SearchReceipt};

pub trait Clock: Send + Sync {
    fn now_rfc3339(&self) -> String;
}

#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_rfc3339(&self) -> String {
        use time::format_description::well_known::Rfc3339;
        time::OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    }
}

// ----------------------------
// Rendering helpers
// ----------------------------

pub fn render_markdown(receipt: &SearchReceipt) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "concprobe: max supported concurrency is **{}**\n\n",
        receipt.result.max_concurrency
    ));

    out.push_str(&format!(
        "**Workload:** `{}` ({} queries)\n\n",
        receipt.workload.name, receipt.workload.queries
    ));
    out.push_str(&format!(
        "**Initial bounds:** [{}, {}]\n\n",
        receipt.initial.min_concurrency, receipt.initial.max_concurrency
    ));

    if receipt.probes.is_empty() {
        out.push_str("No probes were needed.\n");
        return out;
    }

    out.push_str("| # | concurrency | max ops | status | interval after | wall |\n");
    out.push_str("|---:|---:|---:|---|---|---:|\n");

    for (i, p) in receipt.probes.iter().enumerate() {
        let status = match p.status {
            ProbeStatus::Survived => "✅ survived",
            ProbeStatus::Crashed => "❌ crashed",
        };
        out.push_str(&format!(
            "| {n} | {c} | {ops} | {status} | [{lo}, {hi}] | {wall} |\n",
            n = i + 1,
            c = p.concurrency,
            ops = p.max_ops,
            lo = p.after.min_concurrency,
            hi = p.after.max_concurrency,
            wall = format_wall(p.wall_ms),
        ));
    }

    let reasons: Vec<_> = receipt
        .probes
        .iter()
        .filter_map(|p| p.reason.as_ref().map(|r| (p.concurrency, r)))
        .collect();
    if !reasons.is_empty() {
        out.push_str("\n**Notes:**\n");
        for (c, r) in reasons {
            out.push_str(&format!("- {c}: {r}\n"));
        }
    }

    out
}

fn format_wall(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{ms} ms")
    }
}
