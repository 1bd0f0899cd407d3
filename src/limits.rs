use std::time::Duration;

pub const MAX_PEOPLE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
/// Merging keeps sets small; this only stops a pathological client.
pub const MAX_INTERVALS_PER_PERSON: usize = 50_000;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
