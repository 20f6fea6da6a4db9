//! The schedule entries read from the input files, and the parsing of the
//! individual fields that make them up.

use std::{collections::BTreeSet, sync::OnceLock};

use anyhow::{bail, ensure, format_err, Context, Error};
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use regex::Regex;
use tracing::warn;

/// Name used when a row doesn't give one.
pub const DEFAULT_NAME: &str = "Course";

/// Longest stretch of time a single entry may cover.
const MAX_SPAN_DAYS: i64 = 100 * 366;

/// A class that meets on a weekday at a fixed time, repeating every
/// `interval` weeks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub name: String,
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub location: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    /// Number of occurrences. Takes precedence over `end_date`.
    pub count: Option<u32>,
    pub interval: u32,
    /// Dates on which the class does not take place.
    pub exceptions: BTreeSet<NaiveDate>,
    /// Additional dates on which the class takes place.
    pub rdates: BTreeSet<NaiveDate>,
}

impl ScheduleEntry {
    /// An entry that happens only once, on the given date.
    pub fn single(
        name: String,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        location: Option<String>,
    ) -> ScheduleEntry {
        ScheduleEntry {
            name,
            weekday: date.weekday(),
            start,
            end,
            location,
            start_date: date,
            end_date: Some(date),
            count: Some(1),
            interval: 1,
            exceptions: BTreeSet::new(),
            rdates: BTreeSet::new(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            self.end > self.start,
            "End time {} is not after start time {} for {}",
            self.end.format("%H:%M"),
            self.start.format("%H:%M"),
            self.name
        );

        if let Some(end_date) = self.end_date {
            ensure!(
                end_date >= self.start_date,
                "End date {} is before start date {} for {}",
                end_date,
                self.start_date,
                self.name
            );
        }

        ensure!(self.interval >= 1, "Interval must be at least 1 for {}", self.name);

        if let Some(count) = self.count {
            ensure!(count >= 1, "Count must be at least 1 for {}", self.name);
        }

        if let (None, Some(end_date)) = (self.count, self.end_date) {
            ensure!(
                self.first_occurrence() <= end_date,
                "{} has no {:?} between {} and {}",
                self.name,
                self.weekday,
                self.start_date,
                end_date
            );
        }

        Ok(())
    }

    /// Whether the entry is a one-off event without any recurrence.
    pub fn is_single(&self) -> bool {
        self.count == Some(1) && self.rdates.is_empty()
    }

    /// The first date on or after `start_date` that falls on `weekday`.
    pub fn first_occurrence(&self) -> NaiveDate {
        first_date_for_weekday(self.start_date, self.weekday)
    }

    /// The earliest and latest dates the entry can produce an occurrence on,
    /// given a fallback count for entries with no end.
    ///
    /// Entries covering more than a century are rejected.
    pub fn span(&self, fallback_count: u32) -> Result<(NaiveDate, NaiveDate), Error> {
        let first = self.first_occurrence();

        let mut last = match (self.count, self.end_date) {
            (Some(count), _) => last_counted(first, count, self.interval)?,
            (None, Some(end_date)) => end_date,
            (None, None) => last_counted(first, fallback_count, self.interval)?,
        };

        let mut earliest = first.min(self.start_date);
        if let Some(rdate) = self.rdates.iter().next() {
            earliest = earliest.min(*rdate);
        }
        if let Some(rdate) = self.rdates.iter().next_back() {
            last = last.max(*rdate);
        }

        let last = last.max(first);
        ensure!(
            (last - earliest).num_days() <= MAX_SPAN_DAYS,
            "{} runs from {} to {}, which is more than a century",
            self.name,
            earliest,
            last
        );

        Ok((earliest, last))
    }
}

fn last_counted(first: NaiveDate, count: u32, interval: u32) -> Result<NaiveDate, Error> {
    let weeks = i64::from(count.saturating_sub(1)) * i64::from(interval);

    Duration::try_weeks(weeks)
        .and_then(|duration| first.checked_add_signed(duration))
        .ok_or_else(|| {
            format_err!(
                "{} occurrences every {} weeks from {} is out of range",
                count,
                interval,
                first
            )
        })
}

fn year_first_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})$").expect("valid date regex"))
}

fn day_first_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2})-(\d{1,2})-(\d{4})$").expect("valid date regex"))
}

/// The first date on or after `date` that falls on `weekday`.
pub fn first_date_for_weekday(date: NaiveDate, weekday: Weekday) -> NaiveDate {
    let offset = (7 + weekday.num_days_from_monday() - date.weekday().num_days_from_monday()) % 7;
    date + Duration::days(i64::from(offset))
}

/// Parse the many ways a weekday gets written in timetables.
pub fn parse_weekday(text: &str) -> Result<Weekday, Error> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

    let weekday = match &normalized as &str {
        "mon" | "monday" | "mo" | "1" | "周一" | "星期一" => Weekday::Mon,
        "tue" | "tues" | "tuesday" | "tu" | "2" | "周二" | "星期二" => Weekday::Tue,
        "wed" | "weds" | "wednesday" | "we" | "3" | "周三" | "星期三" => Weekday::Wed,
        "thu" | "thur" | "thurs" | "thursday" | "th" | "4" | "周四" | "星期四" => Weekday::Thu,
        "fri" | "friday" | "fr" | "5" | "周五" | "星期五" => Weekday::Fri,
        "sat" | "saturday" | "sa" | "6" | "周六" | "星期六" => Weekday::Sat,
        "sun" | "sunday" | "su" | "7" | "周日" | "周天" | "星期日" | "星期天" => Weekday::Sun,
        _ => bail!("Invalid weekday: '{}'", text),
    };

    Ok(weekday)
}

/// Parse a `H:MM` or `HH:MM` time.
pub fn parse_time(text: &str) -> Result<NaiveTime, Error> {
    let text = text.trim();
    let (hours, minutes) = text
        .split_once(':')
        .ok_or_else(|| format_err!("Invalid time: '{}'", text))?;

    ensure!(
        (1..=2).contains(&hours.len())
            && minutes.len() == 2
            && hours.chars().chain(minutes.chars()).all(|c| c.is_ascii_digit()),
        "Invalid time: '{}'",
        text
    );

    NaiveTime::from_hms_opt(hours.parse()?, minutes.parse()?, 0)
        .ok_or_else(|| format_err!("Invalid time: '{}'", text))
}

/// Parse a date written as `YYYY-M-D` or `D-M-YYYY`, with `-`, `/` or `.`
/// as separators.
pub fn parse_date(text: &str) -> Result<NaiveDate, Error> {
    let normalized = text.trim().replace(&['.', '/'] as &[char], "-");

    let (year, month, day) = if let Some(caps) = year_first_date().captures(&normalized) {
        (caps[1].parse()?, caps[2].parse()?, caps[3].parse()?)
    } else if let Some(caps) = day_first_date().captures(&normalized) {
        (caps[3].parse()?, caps[2].parse()?, caps[1].parse()?)
    } else {
        return NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
            .with_context(|| format!("Invalid date: '{}'", text));
    };

    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| format_err!("Invalid date: '{}'", text))
}

/// Parse a list of dates separated by commas or semicolons. Entries that
/// can't be parsed are skipped.
pub fn parse_date_list(text: &str) -> BTreeSet<NaiveDate> {
    text.split(&[',', ';'] as &[char])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| match parse_date(part) {
            Ok(date) => Some(date),
            Err(err) => {
                warn!("Skipping date '{}': {:#}", part, err);
                None
            }
        })
        .collect()
}
