//! Hard limits. Anything a client can grow without bound gets a cap here.

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CODE_LEN: usize = 32;
pub const MAX_EMAIL_LEN: usize = 320;

pub const MAX_CLASSROOMS: usize = 10_000;
pub const MAX_COURSES: usize = 10_000;
pub const MAX_SUBJECTS: usize = 100_000;
pub const MAX_USERS: usize = 1_000_000;

/// 5 days × 24h of 1-minute slots is far beyond any real room, but bounds the map.
pub const MAX_ENTRIES_PER_CLASSROOM: usize = 5_000;

pub const MAX_COURSES_PER_STUDENT: usize = 64;
pub const MAX_CLASSROOM_CAPACITY: u32 = 100_000;

/// Largest WAL record replay will allocate for. Anything bigger is a torn or
/// corrupt length prefix.
pub const MAX_WAL_RECORD_LEN: usize = 1 << 20;
