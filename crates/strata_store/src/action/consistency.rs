//! Write-consistency admission.
//!
//! Before the primary op runs, the phase checks that enough copies of the
//! target shard are active for the requested consistency level. The check is
//! advisory by design: it reads the primary node's snapshot and does not
//! guarantee the copies are still active when replica requests arrive.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strata_cluster::cluster::IndexShardRoutingTable;

/// Caller-chosen admission threshold on active shard copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteConsistencyLevel {
    /// Defer to the node-level `action.write_consistency` setting.
    #[default]
    Default,
    One,
    Quorum,
    All,
}

impl WriteConsistencyLevel {
    /// Resolve `Default` against the node-level setting.
    pub fn or_default(self, default: WriteConsistencyLevel) -> WriteConsistencyLevel {
        match self {
            WriteConsistencyLevel::Default => default,
            other => other,
        }
    }
}

impl fmt::Display for WriteConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteConsistencyLevel::Default => "default",
            WriteConsistencyLevel::One => "one",
            WriteConsistencyLevel::Quorum => "quorum",
            WriteConsistencyLevel::All => "all",
        };
        f.write_str(name)
    }
}

impl FromStr for WriteConsistencyLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "default" => Ok(WriteConsistencyLevel::Default),
            "one" => Ok(WriteConsistencyLevel::One),
            "quorum" => Ok(WriteConsistencyLevel::Quorum),
            "all" => Ok(WriteConsistencyLevel::All),
            other => Err(format!("unknown write consistency level [{other}]")),
        }
    }
}

/// Copies required for `level` over a shard with `size` copies total.
///
/// Quorum only makes sense with more than two copies; with one shard and one
/// replica a quorum of the pair would make the write depend on the replica.
pub fn required_active_copies(level: WriteConsistencyLevel, size: usize) -> usize {
    match level {
        WriteConsistencyLevel::All => size,
        WriteConsistencyLevel::Quorum if size > 2 => size / 2 + 1,
        _ => 1,
    }
}

/// Admission check. `None` means the write may proceed; `Some` carries the
/// human-readable denial used in the retryable unavailable error.
pub fn consistency_failure(
    level: WriteConsistencyLevel,
    table: Option<&IndexShardRoutingTable>,
) -> Option<String> {
    let (active, required) = match table {
        Some(table) => (
            table.active_shard_count(),
            required_active_copies(level, table.size()),
        ),
        None => (0, 1),
    };
    if active < required {
        Some(format!(
            "not enough active copies to meet write consistency of [{level}] \
             (have {active}, needed {required})."
        ))
    } else {
        None
    }
}
