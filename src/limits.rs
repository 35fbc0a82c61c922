//! Hard caps shared across the engine and the wire layer. These bound
//! memory use and WAL growth for a single installation; none of them
//! are tunable at runtime.

/// Max length of service type names and customer names.
pub const MAX_NAME_LEN: usize = 100;

/// Max length of customer email addresses.
pub const MAX_EMAIL_LEN: usize = 100;

/// Max length of an exclusion day reason.
pub const MAX_REASON_LEN: usize = 200;

/// Max length of a notification template.
pub const MAX_TEMPLATE_LEN: usize = 2000;

/// Max appointment duration. Longer durations would cross midnight,
/// which the conflict filter never considers.
pub const MAX_DURATION_MINUTES: u32 = 12 * 60;

/// Default availability horizon in days.
pub const DEFAULT_LOOKAHEAD_DAYS: u32 = 60;

/// Upper bound on the configurable horizon.
pub const MAX_LOOKAHEAD_DAYS: u32 = 365;

/// Catalog caps.
pub const MAX_SERVICE_TYPES: usize = 1_000;
pub const MAX_RULES: usize = 10_000;
pub const MAX_EXCLUSIONS: usize = 10_000;

/// Bounded retry for storage-level uniqueness conflicts during commit.
pub const MAX_COMMIT_RETRIES: usize = 3;
