//! Domain logic for concprobe.
//!
//! This crate is intentionally I/O-free: it does the bisection math and the
//! batch sizing policy. Probing a real cluster happens in `concprobe-app`.

use concprobe_types::{ProbeStatus, QueryId, SearchBounds};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("concurrency bounds must be positive (got min {0})")]
    ZeroLowerBound(u32),

    #[error("min concurrency {low} must be below max concurrency {high}")]
    EmptyInterval { low: u32, high: u32 },

    #[error("concurrency {level} is outside the open interval ({low}, {high})")]
    OutsideInterval { level: u32, low: u32, high: u32 },

    #[error("query catalog must contain at least one query")]
    EmptyCatalog,
}

/// Each batch requests this fraction of the concurrency as its op cap.
pub const OPS_CAP_DIVISOR: u32 = 10;

/// Operation cap for one query batch at `concurrency`.
///
/// The workload generator counts completed operations globally and only
/// checks the cap after an operation finishes, so a cap near the
/// concurrency lets fast connections run several times. A tenth of the
/// concurrency keeps each connection at roughly one run while still letting
/// every connection start. Clamped to 1 since a zero cap means unbounded.
pub fn max_ops_for(concurrency: u32) -> u32 {
    (concurrency / OPS_CAP_DIVISOR).max(1)
}

/// Open interval of concurrencies whose sustainability is unknown.
///
/// Everything `<= low` is assumed to survive, everything `>= high` is
/// assumed to crash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SearchInterval {
    low: u32,
    high: u32,
}

impl SearchInterval {
    pub fn new(low: u32, high: u32) -> Result<Self, DomainError> {
        if low == 0 {
            return Err(DomainError::ZeroLowerBound(low));
        }
        if low >= high {
            return Err(DomainError::EmptyInterval { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> u32 {
        self.low
    }

    pub fn high(&self) -> u32 {
        self.high
    }

    pub fn width(&self) -> u32 {
        self.high - self.low
    }

    pub fn is_converged(&self) -> bool {
        self.width() == 1
    }

    /// Next level to probe, or `None` once converged.
    pub fn midpoint(&self) -> Option<u32> {
        if self.is_converged() {
            return None;
        }
        Some(self.low + self.width() / 2)
    }

    /// Fold a probe result into the interval.
    pub fn narrow(self, level: u32, status: ProbeStatus) -> Result<Self, DomainError> {
        if level <= self.low || level >= self.high {
            return Err(DomainError::OutsideInterval {
                level,
                low: self.low,
                high: self.high,
            });
        }
        Ok(self.fold(level, status))
    }

    // Caller guarantees low < level < high.
    fn fold(self, level: u32, status: ProbeStatus) -> Self {
        match status {
            ProbeStatus::Survived => Self {
                low: level,
                high: self.high,
            },
            ProbeStatus::Crashed => Self {
                low: self.low,
                high: level,
            },
        }
    }

    /// Upper bound on the number of probes bisection needs to converge.
    pub fn max_probes(&self) -> u32 {
        let w = self.width();
        // ceil(log2(w)) for w >= 1
        u32::BITS - (w - 1).leading_zeros()
    }

    pub fn bounds(&self) -> SearchBounds {
        SearchBounds {
            min_concurrency: self.low,
            max_concurrency: self.high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchStep {
    pub concurrency: u32,
    pub status: ProbeStatus,
    pub after: SearchInterval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTrace {
    pub initial: SearchInterval,
    pub steps: Vec<SearchStep>,
    pub max_concurrency: u32,
}

/// Binary search for the largest sustainable concurrency.
///
/// `probe` is called once per midpoint, strictly one at a time. An `Err`
/// from `probe` aborts the search; a crash is a `ProbeStatus`, not an error.
/// The initial `high` is trusted, never probed.
pub fn bisect<E, F>(initial: SearchInterval, mut probe: F) -> Result<SearchTrace, E>
where
    F: FnMut(u32, &SearchInterval) -> Result<ProbeStatus, E>,
{
    let mut interval = initial;
    let mut steps = Vec::new();

    while let Some(mid) = interval.midpoint() {
        let status = probe(mid, &interval)?;
        interval = interval.fold(mid, status);
        steps.push(SearchStep {
            concurrency: mid,
            status,
            after: interval,
        });
    }

    Ok(SearchTrace {
        initial,
        steps,
        max_concurrency: interval.low(),
    })
}

/// Ordered query identifiers `1..=len`, each exercised once per probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCatalog {
    len: u32,
}

impl QueryCatalog {
    pub fn new(len: u32) -> Result<Self, DomainError> {
        if len == 0 {
            return Err(DomainError::EmptyCatalog);
        }
        Ok(Self { len })
    }

    pub fn tpch() -> Self {
        Self {
            len: concprobe_types::TPCH_QUERY_COUNT,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = QueryId> + use<> {
        (1..=self.len).map(QueryId)
    }
}
