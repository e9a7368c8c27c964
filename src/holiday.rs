//! Holiday enrichment for fetched time series.
//!
//! The calendar is computed, not fetched: fixed-date holidays with weekend
//! substitution plus the Easter-dependent and Monday-rule bank holidays for
//! the UK home nations. Lookups are deterministic for a given
//! `(date, region)` and touch nothing but an in-memory per-year cache.
//!
//! Out-of-range years fail hard rather than quietly reporting
//! `is_holiday = false`: an unmasked real holiday would poison the forecast.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate, Weekday};
use parking_lot::RwLock;

use crate::error::PipelineError;
use crate::models::{HolidayMask, Record};

/// Rule-based holiday generation holds for this window; outside it the
/// statutory rules are not trustworthy.
const MIN_YEAR: i32 = 2000;
const MAX_YEAR: i32 = 2059;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    EnglandWales,
    Scotland,
    NorthernIreland,
}

impl Region {
    fn parse(region: &str) -> Option<Self> {
        match region {
            "uk-england-wales" => Some(Region::EnglandWales),
            "uk-scotland" => Some(Region::Scotland),
            "uk-northern-ireland" => Some(Region::NorthernIreland),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HolidayCalendar {
    region: Region,
    /// Lazily computed year -> (observed date -> holiday name).
    years: RwLock<HashMap<i32, BTreeMap<NaiveDate, String>>>,
}

impl HolidayCalendar {
    pub fn for_region(region: &str) -> Result<Self, PipelineError> {
        let region = Region::parse(region)
            .ok_or_else(|| PipelineError::UnknownCalendarRegion(region.to_string()))?;
        Ok(Self {
            region,
            years: RwLock::new(HashMap::new()),
        })
    }

    /// Annotate each record with its holiday mask. Fails on the first
    /// record outside the supported year range.
    pub fn enrich(
        &self,
        records: Vec<Record>,
    ) -> Result<Vec<(Record, HolidayMask)>, PipelineError> {
        records
            .into_iter()
            .map(|record| {
                let mask = self.mask_for(record.timestamp)?;
                Ok((record, mask))
            })
            .collect()
    }

    /// Holiday mask for a single instant.
    pub fn mask_for(
        &self,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Result<HolidayMask, PipelineError> {
        let date = timestamp.date_naive();
        let name = self.holiday_name(date)?;
        Ok(HolidayMask {
            timestamp,
            is_holiday: name.is_some(),
            holiday_name: name,
        })
    }

    fn holiday_name(&self, date: NaiveDate) -> Result<Option<String>, PipelineError> {
        let year = date.year();
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(PipelineError::CalendarRangeExceeded {
                year,
                min: MIN_YEAR,
                max: MAX_YEAR,
            });
        }

        if let Some(known) = self.years.read().get(&year) {
            return Ok(known.get(&date).cloned());
        }

        let computed = holidays_for_year(self.region, year);
        let name = computed.get(&date).cloned();
        self.years.write().insert(year, computed);
        Ok(name)
    }
}

/// Weekend substitution: a holiday landing on Saturday is observed the
/// following Monday, Sunday the following Monday as well.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date + chrono::Duration::days(2),
        Weekday::Sun => date + chrono::Duration::days(1),
        _ => date,
    }
}

fn insert_observed(map: &mut BTreeMap<NaiveDate, String>, date: NaiveDate, name: &str) {
    let mut slot = observed(date);
    // Paired holidays (Christmas/Boxing Day) may shift onto each other;
    // the later one rolls to the next free weekday.
    while map.contains_key(&slot) {
        slot += chrono::Duration::days(1);
    }
    map.insert(slot, name.to_string());
}

fn holidays_for_year(region: Region, year: i32) -> BTreeMap<NaiveDate, String> {
    let mut map = BTreeMap::new();
    let d = |m: u32, day: u32| NaiveDate::from_ymd_opt(year, m, day).unwrap();

    insert_observed(&mut map, d(1, 1), "New Year's Day");
    if region == Region::Scotland {
        insert_observed(&mut map, d(1, 2), "2nd January");
    }
    if region == Region::NorthernIreland {
        insert_observed(&mut map, d(3, 17), "St Patrick's Day");
    }

    let easter = easter_sunday(year);
    map.insert(
        easter - chrono::Duration::days(2),
        "Good Friday".to_string(),
    );
    if region != Region::Scotland {
        map.insert(easter + chrono::Duration::days(1), "Easter Monday".to_string());
    }

    map.insert(
        nth_weekday(year, 5, Weekday::Mon, 1),
        "Early May Bank Holiday".to_string(),
    );
    map.insert(
        last_weekday(year, 5, Weekday::Mon),
        "Spring Bank Holiday".to_string(),
    );

    if region == Region::NorthernIreland {
        insert_observed(&mut map, d(7, 12), "Battle of the Boyne");
    }

    let summer = if region == Region::Scotland {
        nth_weekday(year, 8, Weekday::Mon, 1)
    } else {
        last_weekday(year, 8, Weekday::Mon)
    };
    map.insert(summer, "Summer Bank Holiday".to_string());

    if region == Region::Scotland {
        insert_observed(&mut map, d(11, 30), "St Andrew's Day");
    }

    insert_observed(&mut map, d(12, 25), "Christmas Day");
    insert_observed(&mut map, d(12, 26), "Boxing Day");

    map
}

/// Gregorian computus (anonymous algorithm).
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).unwrap()
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let offset = (7 + weekday.num_days_from_monday() as i64
        - first.weekday().num_days_from_monday() as i64)
        % 7;
    first + chrono::Duration::days(offset + 7 * (n as i64 - 1))
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    let last = first_next - chrono::Duration::days(1);
    let offset = (7 + last.weekday().num_days_from_monday() as i64
        - weekday.num_days_from_monday() as i64)
        % 7;
    last - chrono::Duration::days(offset)
}
