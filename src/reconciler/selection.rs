//! Agent selection for session placement.
//!
//! Among online agents matching the required platform, pick the least
//! loaded one whose remaining capacity admits the request.

use crate::domain::{ResourceSpec, ResourceUsage};
use crate::storage::AgentRecord;

/// Selects the placement target from `candidates`.
///
/// `usage_of` supplies current consumption per candidate (summed from the
/// session store, not the cached counter, so a stale counter cannot
/// over-commit an agent). Candidates are ordered by `active_sessions`
/// ascending; the first whose capacity admits the request wins.
pub fn select_agent<'a, F>(
    candidates: &'a [AgentRecord],
    platform: &str,
    request: &ResourceSpec,
    usage_of: F,
) -> Option<&'a AgentRecord>
where
    F: Fn(&AgentRecord) -> ResourceUsage,
{
    let mut matching: Vec<&AgentRecord> = candidates
        .iter()
        .filter(|agent| agent.platform == platform)
        .collect();
    matching.sort_by_key(|agent| agent.active_sessions);

    matching
        .into_iter()
        .find(|agent| agent.capacity.admits(&usage_of(agent), request))
}
