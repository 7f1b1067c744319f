pub const MAX_EVENTS: usize = 100_000;
pub const MAX_GENERATORS_PER_EVENT: usize = 64;
pub const MAX_OCCURRENCES_PER_EVENT: usize = 50_000;
pub const MAX_EXCLUSIONS_PER_EVENT: usize = 10_000;

/// Upper bound on candidates a single expansion may yield before the horizon.
/// Roughly ten years of a daily rule.
pub const MAX_CANDIDATES_PER_GENERATOR: usize = 4_000;

pub const MAX_TITLE_LEN: usize = 512;
pub const MAX_DESCRIPTION_LEN: usize = 16_384;
pub const MAX_RULE_LEN: usize = 1024;
