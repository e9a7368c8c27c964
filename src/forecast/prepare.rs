//! Series preparation ahead of the forecast service call.
//!
//! The service requires a gap-free series at the configured granularity and
//! does not impute. The imputation policy here is carry-forward: a missing
//! slot takes the last observed value. Off-grid observations are snapped
//! down to their grid slot; when several land in one slot the latest wins.

use chrono::{DateTime, Duration, Utc};

/// Fill gaps between the first and last observation at `granularity`.
/// Returns an empty series unchanged.
pub fn fill_gaps(
    series: &[(DateTime<Utc>, f64)],
    granularity: Duration,
) -> Vec<(DateTime<Utc>, f64)> {
    let (first, last) = match (series.first(), series.last()) {
        (Some(f), Some(l)) => (f.0, l.0),
        _ => return Vec::new(),
    };
    let step = granularity.num_seconds().max(1);

    let snap = |ts: DateTime<Utc>| {
        let offset = (ts - first).num_seconds();
        first + Duration::seconds(offset - offset.rem_euclid(step))
    };

    let mut observed = std::collections::BTreeMap::new();
    for &(ts, value) in series {
        observed.insert(snap(ts), value);
    }

    let mut filled = Vec::new();
    let mut cursor = first;
    let mut carry = series[0].1;
    let end = snap(last);
    while cursor <= end {
        if let Some(&value) = observed.get(&cursor) {
            carry = value;
        }
        filled.push((cursor, carry));
        cursor += Duration::seconds(step);
    }
    filled
}

/// Grid timestamps for a horizon of `length` steps after the series end.
pub fn horizon_grid(
    series_end: DateTime<Utc>,
    granularity: Duration,
    length: usize,
) -> Vec<DateTime<Utc>> {
    (1..=length as i64)
        .map(|i| series_end + Duration::seconds(granularity.num_seconds() * i))
        .collect()
}
