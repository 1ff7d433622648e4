//! Cache key derivation
//!
//! A key is `{folder}/{md5hex}_{bucketEpochSeconds}.{ext}` where `md5hex` is
//! the lowercase hex digest of the exact query text and `bucketEpochSeconds`
//! is midnight UTC of the bucket start date. Identical query text, the same
//! granularity and the same calendar bucket always derive the same key,
//! without any network call.
//!
//! This is a textual cache: two different spellings of semantically
//! equivalent SQL get different keys on purpose.

use chrono::{Datelike, Days, NaiveDate, Utc};

use crate::codec::Format;
use crate::types::Granularity;

/// Source of "today" for bucket truncation.
///
/// Injected so bucket-boundary behavior is testable with a fixed date;
/// production code uses [`SystemClock`].
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall-clock dates in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Truncate `today` to the start of its bucket.
///
/// Weekly buckets anchor to the most recent Monday on or before `today`,
/// monthly buckets to the first day of the current month.
pub fn bucket_start(granularity: Granularity, today: NaiveDate) -> NaiveDate {
    match granularity {
        Granularity::Daily => today,
        Granularity::Weekly => today
            .checked_sub_days(Days::new(u64::from(today.weekday().num_days_from_monday())))
            .expect("date within chrono range"),
        Granularity::Monthly => today.with_day(1).expect("day 1 is always valid"),
    }
}

/// Epoch seconds at midnight UTC of the bucket start date.
pub fn bucket_epoch(granularity: Granularity, today: NaiveDate) -> i64 {
    bucket_start(granularity, today)
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
        .timestamp()
}

/// Derive the object-store key for a query. Pure function of its arguments.
pub fn derive_key(
    sql: &str,
    granularity: Granularity,
    folder: &str,
    format: Format,
    today: NaiveDate,
) -> String {
    let digest = md5::compute(sql.as_bytes());
    format!(
        "{}/{:x}_{}.{}",
        folder,
        digest,
        bucket_epoch(granularity, today),
        format.extension()
    )
}
