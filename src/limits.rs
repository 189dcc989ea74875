use crate::model::Ms;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Widest window a single slot query may cover (62 days).
pub const MAX_QUERY_WINDOW_MS: Ms = 62 * 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_ANSWERS: usize = 32;
pub const MAX_ANSWER_LEN: usize = 4096;

pub const MAX_DURATIONS_PER_TEMPLATE: usize = 16;
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_BUFFER_MINUTES: u32 = 24 * 60;
pub const MAX_NOTICE_MINUTES: u32 = 365 * 24 * 60;
pub const MAX_SCHEDULE_DAYS: u32 = 730;
pub const MAX_POOLED_HOSTS: usize = 32;

pub const MAX_RULES_PER_HOST: usize = 64;
pub const MAX_CONNECTIONS_PER_HOST: usize = 16;
/// Live (pending or confirmed) bookings a host may hold at once.
pub const MAX_BOOKINGS_PER_HOST: usize = 100_000;
pub const MAX_BUSY_SPANS_PER_SNAPSHOT: usize = 50_000;

pub const MAX_SLOTS_PER_QUERY: usize = 10_000;
pub const MAX_BULK_ARCHIVE: usize = 10_000;
