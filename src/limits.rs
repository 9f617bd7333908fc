//! Hard caps on inputs and state growth. These protect the server from
//! malformed or abusive requests; legitimate clinics stay far below them.

use crate::model::Ms;

pub const MAX_SESSIONS_PER_CLINIC: usize = 100_000;

/// All bookings ever taken on one session, cancelled included.
pub const MAX_BOOKINGS_PER_SESSION: usize = 10_000;

pub const MAX_SESSION_CAPACITY: u32 = 1_000;

pub const MAX_NAME_LEN: usize = 256;

/// Free-text clinical fields (diagnosis, advice, history, ...).
pub const MAX_TEXT_FIELD_LEN: usize = 4_096;

pub const MAX_LINES_PER_VISIT: usize = 100;

pub const MAX_PATIENTS_PER_CLINIC: usize = 1_000_000;

pub const MAX_DRUGS_PER_CLINIC: usize = 100_000;

pub const MAX_CLINICS: usize = 1_000;

pub const MAX_CLINIC_NAME_LEN: usize = 256;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A schedule session never spans more than a week.
pub const MAX_SESSION_DURATION_MS: Ms = 7 * 24 * 3_600_000;
