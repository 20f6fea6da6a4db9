use std::{
    collections::VecDeque,
    fmt::{self, Display},
    str::FromStr,
};

use anyhow::{bail, format_err, Context, Error};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;
use itertools::Itertools;

use crate::parser;

const DATE_FORMAT: &str = "%Y%m%d";
const LOCAL_FORMAT: &str = "%Y%m%dT%H%M%S";
const UTC_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Number of consecutive empty periods after which a rule is considered to
/// never produce another instance.
const MAX_EMPTY_PERIODS: u32 = 1000;

/// The two letter code used for a weekday in recurrence rules.
pub fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

pub fn parse_weekday_code(value: &str) -> Option<Weekday> {
    Some(match &value.to_ascii_uppercase() as &str {
        "MO" => Weekday::Mon,
        "TU" => Weekday::Tue,
        "WE" => Weekday::Wed,
        "TH" => Weekday::Thu,
        "FR" => Weekday::Fri,
        "SA" => Weekday::Sat,
        "SU" => Weekday::Sun,
        _ => return None,
    })
}

/// Parse a UTC offset such as `+0800` or `-053000`.
pub fn parse_offset(value: &str) -> Result<FixedOffset, Error> {
    if !value.starts_with(&['+', '-'] as &[char]) || !(value.len() == 5 || value.len() == 7) {
        bail!("Invalid UTC offset: {}", value)
    }

    let hours: i32 = value[1..3].parse()?;
    let minutes: i32 = value[3..5].parse()?;
    let seconds: i32 = if value.len() == 7 {
        value[5..].parse()?
    } else {
        0
    };

    let total = hours * 60 * 60 + minutes * 60 + seconds;

    let offset = if value.starts_with('+') {
        FixedOffset::east_opt(total)
    } else {
        FixedOffset::west_opt(total)
    };

    offset.ok_or_else(|| format_err!("UTC offset out of range: {}", value))
}

pub fn format_offset(offset: FixedOffset) -> String {
    let total = offset.local_minus_utc();
    let sign = if total < 0 { '-' } else { '+' };
    let total = total.abs();

    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);

    if seconds == 0 {
        format!("{}{:02}{:02}", sign, hours, minutes)
    } else {
        format!("{}{:02}{:02}{:02}", sign, hours, minutes, seconds)
    }
}

/// Parse a DURATION value such as `PT1H30M` or `-P1W`.
pub fn parse_duration(value: &str) -> Result<Duration, Error> {
    let re = regex::Regex::new(
        r"^([+-])?P(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$",
    )?;

    let captures = re
        .captures(value.trim())
        .ok_or_else(|| format_err!("Invalid duration: {}", value))?;

    let mut seconds: i64 = 0;
    for (group, unit) in [(2, 7 * 24 * 3600), (3, 24 * 3600), (4, 3600), (5, 60), (6, 1)] {
        if let Some(m) = captures.get(group) {
            let amount: i64 = m
                .as_str()
                .parse()
                .with_context(|| format!("Invalid duration: {}", value))?;
            seconds += amount * unit;
        }
    }

    if captures.get(1).map(|m| m.as_str()) == Some("-") {
        seconds = -seconds;
    }

    Ok(Duration::seconds(seconds))
}

pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let total = total.abs();

    let (days, hours, minutes, seconds) = (
        total / (24 * 3600),
        total % (24 * 3600) / 3600,
        total % 3600 / 60,
        total % 60,
    );

    let mut out = format!("{}P", sign);
    if days > 0 {
        out.push_str(&format!("{}D", days));
    }
    if hours > 0 || minutes > 0 || seconds > 0 || days == 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes > 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if seconds > 0 || (hours == 0 && minutes == 0) {
            out.push_str(&format!("{}S", seconds));
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IcalDateTime {
    Local(NaiveDateTime),
    Utc(DateTime<Utc>),
    TZ { date: NaiveDateTime, tzid: String },
}

impl IcalDateTime {
    /// Return the duration between two date times of the same kind.
    pub fn sub(&self, other: &IcalDateTime) -> Result<Duration, Error> {
        match (self, other) {
            (IcalDateTime::Local(left), IcalDateTime::Local(right)) => Ok(*left - *right),
            (IcalDateTime::Utc(left), IcalDateTime::Utc(right)) => Ok(*left - *right),
            (
                IcalDateTime::TZ {
                    date: left,
                    tzid: left_tzid,
                },
                IcalDateTime::TZ {
                    date: right,
                    tzid: right_tzid,
                },
            ) if left_tzid == right_tzid => Ok(*left - *right),
            _ => bail!("Mismatched IcalDateTime"),
        }
    }

    /// The wall clock time in the zone described by `offseter`.
    pub fn to_local(&self, offseter: &dyn Offseter) -> NaiveDateTime {
        match self {
            IcalDateTime::Local(date) => *date,
            IcalDateTime::TZ { date, .. } => *date,
            IcalDateTime::Utc(date) => offseter.from_instance(date.fixed_offset()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DateOrDateTime {
    Date(NaiveDate),
    DateTime(IcalDateTime),
}

impl DateOrDateTime {
    /// Parse a single value, using the `VALUE` and `TZID` parameters of the
    /// property it came from.
    pub fn parse_from(value: &str, property: &parser::Property) -> Result<Self, Error> {
        let value = value.trim();
        let value_type = property.parameter("VALUE").map(str::to_ascii_uppercase);

        match value_type.as_deref() {
            Some("PERIOD") => bail!("PERIOD values are not supported"),
            Some("DATE") => {
                return Ok(DateOrDateTime::Date(
                    NaiveDate::parse_from_str(value, DATE_FORMAT)
                        .with_context(|| format!("Invalid date: {}", value))?,
                ))
            }
            _ => {}
        }

        if !value.contains('T') {
            return Ok(DateOrDateTime::Date(
                NaiveDate::parse_from_str(value, DATE_FORMAT)
                    .with_context(|| format!("Invalid date: {}", value))?,
            ));
        }

        if value.ends_with('Z') {
            let parsed = NaiveDateTime::parse_from_str(value, UTC_FORMAT)
                .with_context(|| format!("Invalid date time: {}", value))?;
            Ok(DateOrDateTime::DateTime(IcalDateTime::Utc(parsed.and_utc())))
        } else {
            let date = NaiveDateTime::parse_from_str(value, LOCAL_FORMAT)
                .with_context(|| format!("Invalid date time: {}", value))?;

            if let Some(tzid) = property.parameter("TZID") {
                Ok(DateOrDateTime::DateTime(IcalDateTime::TZ {
                    date,
                    tzid: tzid.to_string(),
                }))
            } else {
                Ok(DateOrDateTime::DateTime(IcalDateTime::Local(date)))
            }
        }
    }

    /// Parse a property whose value may be a comma separated list, such as
    /// EXDATE or RDATE.
    pub fn parse_list(property: &parser::Property) -> Result<Vec<Self>, Error> {
        property
            .value
            .split(',')
            .filter(|v| !v.trim().is_empty())
            .map(|v| DateOrDateTime::parse_from(v, property))
            .collect()
    }

    pub fn to_property(&self, name: &str) -> parser::Property {
        match self {
            DateOrDateTime::Date(date) => {
                parser::Property::new(name, date.format(DATE_FORMAT).to_string())
                    .with_parameter("VALUE", "DATE")
            }
            DateOrDateTime::DateTime(IcalDateTime::Local(date)) => {
                parser::Property::new(name, date.format(LOCAL_FORMAT).to_string())
            }
            DateOrDateTime::DateTime(IcalDateTime::Utc(date)) => {
                parser::Property::new(name, date.format(UTC_FORMAT).to_string())
            }
            DateOrDateTime::DateTime(IcalDateTime::TZ { date, tzid }) => {
                parser::Property::new(name, date.format(LOCAL_FORMAT).to_string())
                    .with_parameter("TZID", tzid.as_str())
            }
        }
    }

    pub fn tzid(&self) -> Option<&str> {
        match self {
            DateOrDateTime::DateTime(IcalDateTime::TZ { tzid, .. }) => Some(tzid),
            _ => None,
        }
    }
}

pub trait Offseter {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset>;
    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime;
}

impl Offseter for FixedOffset {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset> {
        let utc = d - Duration::seconds(i64::from(self.local_minus_utc()));
        self.from_utc_datetime(&utc)
    }

    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime {
        d.with_timezone(self).naive_local()
    }
}

impl Offseter for Tz {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset> {
        // Times skipped by a forward transition resolve to an hour later.
        self.from_local_datetime(&d)
            .earliest()
            .or_else(|| self.from_local_datetime(&(d + Duration::hours(1))).earliest())
            .unwrap_or_else(|| self.from_utc_datetime(&d))
            .fixed_offset()
    }

    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime {
        d.with_timezone(self).naive_local()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    /// The start of the `steps`th period after `date`.
    ///
    /// Monthly and yearly periods that land on a day that does not exist
    /// (e.g. 31st of April) are `Some(None)`; `None` means the result is out of
    /// range.
    pub fn advance_date(self, date: NaiveDateTime, steps: u64) -> Option<Option<NaiveDateTime>> {
        let steps_i64 = i64::try_from(steps).ok()?;

        let advanced = match self {
            Frequency::Secondly => date.checked_add_signed(Duration::try_seconds(steps_i64)?),
            Frequency::Minutely => date.checked_add_signed(Duration::try_minutes(steps_i64)?),
            Frequency::Hourly => date.checked_add_signed(Duration::try_hours(steps_i64)?),
            Frequency::Daily => date.checked_add_signed(Duration::try_days(steps_i64)?),
            Frequency::Weekly => date.checked_add_signed(Duration::try_weeks(steps_i64)?),
            Frequency::Monthly | Frequency::Yearly => {
                let months = if self == Frequency::Yearly {
                    steps.checked_mul(12)?
                } else {
                    steps
                };
                let advanced = date.checked_add_months(Months::new(u32::try_from(months).ok()?))?;

                // chrono clamps to the end of the month, which is not how
                // recurrence rules behave.
                return Some(if advanced.day() == date.day() {
                    Some(advanced)
                } else {
                    None
                });
            }
        };

        advanced.map(Some)
    }
}

impl FromStr for Frequency {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match &value.to_ascii_uppercase() as &str {
            "SECONDLY" => Frequency::Secondly,
            "MINUTELY" => Frequency::Minutely,
            "HOURLY" => Frequency::Hourly,
            "DAILY" => Frequency::Daily,
            "WEEKLY" => Frequency::Weekly,
            "MONTHLY" => Frequency::Monthly,
            "YEARLY" => Frequency::Yearly,
            _ => bail!("Invalid frequency: '{}'", value),
        })
    }
}

impl Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Frequency::Secondly => "SECONDLY",
            Frequency::Minutely => "MINUTELY",
            Frequency::Hourly => "HOURLY",
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndCondition {
    Count(u64),
    Until(NaiveDateTime),
    UntilUtc(DateTime<Utc>),
    UntilDate(NaiveDate),
    Infinite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecurRule {
    pub frequency: Frequency,
    pub interval: u64,
    pub end_condition: EndCondition,
    pub by_day: Vec<Weekday>,
    pub week_start: Weekday,
}

impl RecurRule {
    pub fn weekly(interval: u64, day: Weekday, end_condition: EndCondition) -> RecurRule {
        RecurRule {
            frequency: Frequency::Weekly,
            interval,
            end_condition,
            by_day: vec![day],
            week_start: Weekday::Mon,
        }
    }

    /// Iterate over the instances of the rule starting at `date`, in local
    /// time. `offseter` is used to interpret a UTC `UNTIL`.
    pub fn from_date(&self, date: NaiveDateTime, offseter: &dyn Offseter) -> RecurIter {
        let (max_count, until) = match self.end_condition {
            EndCondition::Count(c) => (Some(c), None),
            EndCondition::Until(t) => (None, Some(t)),
            EndCondition::UntilUtc(t) => (None, Some(offseter.from_instance(t.fixed_offset()))),
            EndCondition::UntilDate(d) => {
                // A date UNTIL includes the whole of that day.
                let end_of_day = d.and_time(NaiveTime::MIN) + Duration::days(1) - Duration::seconds(1);
                (None, Some(end_of_day))
            }
            EndCondition::Infinite => (None, None),
        };

        RecurIter {
            recur: self.clone(),
            start: date,
            period: 0,
            empty_periods: 0,
            queue: VecDeque::new(),
            count: 0,
            max_count,
            until,
            finished: false,
        }
    }

    /// Expand the candidate instances for the given period start.
    fn expand_period(&self, period_start: NaiveDateTime, start: NaiveDateTime) -> Vec<NaiveDateTime> {
        if self.by_day.is_empty() {
            return vec![period_start];
        }

        let week_start = get_start_of_week(self.week_start, period_start.date());

        self.by_day
            .iter()
            .map(|day| {
                let offset = (7 + day.num_days_from_monday()
                    - self.week_start.num_days_from_monday())
                    % 7;
                (week_start + Duration::days(i64::from(offset))).and_time(start.time())
            })
            .filter(|d| *d >= start)
            .sorted()
            .dedup()
            .collect()
    }
}

impl Display for RecurRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FREQ={}", self.frequency)?;

        if self.interval != 1 {
            write!(f, ";INTERVAL={}", self.interval)?;
        }

        if !self.by_day.is_empty() {
            let days = self.by_day.iter().map(|d| weekday_code(*d)).join(",");
            write!(f, ";BYDAY={}", days)?;
        }

        if self.week_start != Weekday::Mon {
            write!(f, ";WKST={}", weekday_code(self.week_start))?;
        }

        match &self.end_condition {
            EndCondition::Count(count) => write!(f, ";COUNT={}", count),
            EndCondition::Until(until) => write!(f, ";UNTIL={}", until.format(LOCAL_FORMAT)),
            EndCondition::UntilUtc(until) => write!(f, ";UNTIL={}", until.format(UTC_FORMAT)),
            EndCondition::UntilDate(until) => write!(f, ";UNTIL={}", until.format(DATE_FORMAT)),
            EndCondition::Infinite => Ok(()),
        }
    }
}

impl FromStr for RecurRule {
    type Err = Error;

    fn from_str(rule_value_string: &str) -> Result<Self, Self::Err> {
        let mut frequency = None;
        let mut interval = 1;
        let mut end_condition = EndCondition::Infinite;
        let mut by_day = Vec::new();
        let mut week_start = Weekday::Mon;

        for part in rule_value_string.split(';').filter(|p| !p.is_empty()) {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| format_err!("Invalid recur rule: '{}'", part))?;

            match &name.to_ascii_uppercase() as &str {
                "FREQ" => frequency = Some(value.parse::<Frequency>()?),
                "UNTIL" => {
                    end_condition = if value.contains('T') {
                        if value.ends_with('Z') {
                            let parsed = NaiveDateTime::parse_from_str(value, UTC_FORMAT)
                                .with_context(|| format!("Invalid recur rule date: {}", part))?;
                            EndCondition::UntilUtc(parsed.and_utc())
                        } else {
                            let parsed = NaiveDateTime::parse_from_str(value, LOCAL_FORMAT)
                                .with_context(|| format!("Invalid recur rule date: {}", part))?;
                            EndCondition::Until(parsed)
                        }
                    } else {
                        let parsed = NaiveDate::parse_from_str(value, DATE_FORMAT)
                            .with_context(|| format!("Invalid recur rule date: {}", part))?;
                        EndCondition::UntilDate(parsed)
                    }
                }
                "COUNT" => {
                    end_condition = EndCondition::Count(
                        value
                            .parse::<u64>()
                            .with_context(|| format!("Invalid recur rule option: {}", part))?,
                    )
                }
                "INTERVAL" => {
                    interval = value
                        .parse::<u64>()
                        .with_context(|| format!("Invalid recur rule option: {}", part))?;

                    if interval == 0 {
                        bail!("Invalid recur rule option: {}", part)
                    }
                }
                "BYDAY" => {
                    for val in value.split_terminator(',') {
                        let weekday = parse_weekday_code(val.trim()).ok_or_else(|| {
                            format_err!("Unsupported recur rule option: '{}'", part)
                        })?;
                        by_day.push(weekday);
                    }
                }
                "WKST" => {
                    week_start = parse_weekday_code(value)
                        .ok_or_else(|| format_err!("Invalid recur rule option: {}", part))?;
                }
                "BYSECOND" | "BYMINUTE" | "BYHOUR" | "BYMONTHDAY" | "BYYEARDAY" | "BYWEEKNO"
                | "BYMONTH" | "BYSETPOS" => bail!("Unsupported recur rule option: '{}'", part),
                _ => bail!("Invalid recur rule option: '{}'", part),
            }
        }

        let frequency = frequency.ok_or_else(|| format_err!("Missing FREQ in RRULE"))?;

        if !by_day.is_empty() && frequency != Frequency::Weekly {
            bail!("Unsupported recur rule combination: BYDAY is only supported for WEEKLY rules");
        }

        Ok(RecurRule {
            frequency,
            interval,
            end_condition,
            by_day,
            week_start,
        })
    }
}

/// Something that removes instances from a recurrence set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    At(NaiveDateTime),
    Day(NaiveDate),
}

impl Exclusion {
    pub fn excludes(&self, date: &NaiveDateTime) -> bool {
        match self {
            Exclusion::At(at) => at == date,
            Exclusion::Day(day) => *day == date.date(),
        }
    }
}

/// Merge extra dates into an ordered stream of instances and drop the
/// excluded ones.
pub fn with_extras<'a>(
    instances: impl Iterator<Item = NaiveDateTime> + 'a,
    mut rdates: Vec<NaiveDateTime>,
    exclusions: Vec<Exclusion>,
) -> impl Iterator<Item = NaiveDateTime> + 'a {
    rdates.sort();

    instances
        .merge(rdates)
        .dedup()
        .filter(move |d| exclusions.iter().all(|ex| !ex.excludes(d)))
}

pub struct RecurIter {
    recur: RecurRule,
    start: NaiveDateTime,
    period: u64,
    empty_periods: u32,
    queue: VecDeque<NaiveDateTime>,
    max_count: Option<u64>,
    until: Option<NaiveDateTime>,
    count: u64,
    finished: bool,
}

impl RecurIter {
    fn fill_queue(&mut self) {
        while self.queue.is_empty() && !self.finished {
            let steps = match self.period.checked_mul(self.recur.interval) {
                Some(steps) => steps,
                None => {
                    self.finished = true;
                    return;
                }
            };
            self.period += 1;

            let period_start = match self.recur.frequency.advance_date(self.start, steps) {
                Some(Some(date)) => date,
                Some(None) => {
                    self.note_empty_period();
                    continue;
                }
                None => {
                    self.finished = true;
                    return;
                }
            };

            let date_set = self.recur.expand_period(period_start, self.start);

            let earliest = date_set.first().copied().unwrap_or(period_start);
            if let Some(until) = self.until {
                if earliest > until {
                    self.finished = true;
                    return;
                }
            }

            if date_set.is_empty() {
                self.note_empty_period();
            } else {
                self.empty_periods = 0;
                self.queue = date_set.into();
            }
        }
    }

    fn note_empty_period(&mut self) {
        self.empty_periods += 1;
        if self.empty_periods >= MAX_EMPTY_PERIODS {
            self.finished = true;
        }
    }
}

impl Iterator for RecurIter {
    type Item = NaiveDateTime;

    fn next(&mut self) -> Option<NaiveDateTime> {
        self.fill_queue();

        let to_return = self.queue.pop_front()?;

        if let Some(max_count) = self.max_count {
            if self.count >= max_count {
                self.finished = true;
                self.queue.clear();
                return None;
            }
        }
        if let Some(until) = self.until {
            if to_return > until {
                self.finished = true;
                self.queue.clear();
                return None;
            }
        }

        self.count += 1;

        Some(to_return)
    }
}

fn get_start_of_week(week_start: Weekday, date: NaiveDate) -> NaiveDate {
    let days_since_start =
        (7 + date.weekday().num_days_from_monday() - week_start.num_days_from_monday()) % 7;

    date - Duration::days(i64::from(days_since_start))
}
