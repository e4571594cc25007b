use warden_protocol::Tier;

/// Read-only pairs: no state changes, never snapshotted.
const READ_ONLY_ACTIONS: [(&str, &str); 7] = [
    ("fs", "read"),
    ("fs", "list"),
    ("fs", "search"),
    ("git", "status"),
    ("git", "diff"),
    ("web", "search"),
    ("profiles", "lint"),
];

/// Single-file mutations, tier 1 when exactly one file is involved.
const SINGLE_FILE_ACTIONS: [(&str, &str); 3] = [
    ("fs", "apply_patch"),
    ("git", "commit"),
    ("git", "checkout"),
];

/// Map `(capability, action, file_count)` to a risk tier.
///
/// Tier 3 (destructive, explicit confirmation) is reserved: nothing
/// classifies into it yet, and the router refuses unrecognized actions
/// outright. Anything unclassified lands in tier 2, the conservative
/// default.
pub fn classify_tier(capability: &str, action: &str, file_count: usize) -> Tier {
    if READ_ONLY_ACTIONS.contains(&(capability, action)) {
        return Tier::ReadOnly;
    }
    if SINGLE_FILE_ACTIONS.contains(&(capability, action)) && file_count == 1 {
        return Tier::SingleFile;
    }
    if file_count > 1 {
        return Tier::MultiFile;
    }
    Tier::MultiFile
}
