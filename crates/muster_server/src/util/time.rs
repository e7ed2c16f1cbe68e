#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds. Row timestamps and frame
/// timestamps use this; queue due times use whole seconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |d| d.as_millis() as i64)
}

/// Convert a millisecond timestamp to whole Unix seconds, rounding
/// toward negative infinity so pre-epoch values stay ordered.
#[inline]
pub fn ms_to_unix_secs(ms: i64) -> i64 {
	ms.div_euclid(1000)
}
