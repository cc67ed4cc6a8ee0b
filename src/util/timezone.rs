use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// Output layout for every timestamp column served to clients.
pub const ROW_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn localized_datetime(epoch_seconds: i64, tz: Tz) -> Option<DateTime<Tz>> {
    let utc = DateTime::<Utc>::from_timestamp(epoch_seconds, 0)?;
    Some(tz.from_utc_datetime(&utc.naive_utc()))
}

/// Format upstream epoch seconds as `YYYY-MM-DD HH:mm:ss` in `tz`.
///
/// Zero and missing values are treated as "never happened" by the upstream.
pub fn format_epoch(epoch_seconds: Option<i64>, tz: Tz) -> Option<String> {
    let seconds = epoch_seconds.filter(|value| *value > 0)?;
    localized_datetime(seconds, tz).map(|dt| dt.format(ROW_TIMESTAMP_FORMAT).to_string())
}

/// Epoch seconds of local midnight at the start of `date`.
pub fn start_of_day(date: NaiveDate, tz: Tz) -> Option<i64> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}
