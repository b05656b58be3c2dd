use crate::model::Ms;

pub const MAX_CALENDARS: usize = 10_000;
pub const MAX_RULES_PER_CALENDAR: usize = 1_000;
pub const MAX_APPOINTMENTS_PER_CALENDAR: usize = 200_000;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_SEARCH_PARAMS: usize = 32;
pub const MAX_SEARCH_VALUE_LEN: usize = 1_024;

/// Largest `Plus_<minutes>` offset accepted (one year).
pub const MAX_OFFSET_MINUTES: u32 = 525_600;

/// 1900-01-01T00:00:00Z. Date fields predating the epoch are legitimate.
pub const MIN_VALID_TIMESTAMP_MS: Ms = -2_208_988_800_000;
/// 9999-12-31T23:59:59Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_000;
