use crate::model::Ms;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_EVENTS: usize = 1_000_000;
pub const MAX_RESOURCES_PER_EVENT: usize = 256;
/// Upper bound on resource ids in one conflict check.
pub const MAX_IN_CLAUSE_IDS: usize = 1_024;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_KIND_LEN: usize = 50;
pub const MAX_DESCRIPTION_LEN: usize = 64 * 1024;

/// 1900-01-01T00:00
pub const MIN_VALID_TIMESTAMP_MS: Ms = -2_208_988_800_000;
/// 2200-01-01T00:00
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
