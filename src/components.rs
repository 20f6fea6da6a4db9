use crate::{
    config::Options,
    escape::{escape, unescape},
    parser::{self, Component},
    property::{
        format_duration, format_offset, parse_duration, parse_offset, with_extras,
        DateOrDateTime, EndCondition, Exclusion, IcalDateTime, Offseter, RecurRule,
    },
    schedule::ScheduleEntry,
};
use std::convert::TryFrom;
use std::iter;
use std::str::FromStr;

use anyhow::{bail, ensure, format_err, Context, Error};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc,
};
use chrono_tz::{OffsetComponents, Tz};
use tracing::{debug, warn};
use uuid::Uuid;

const UID_DOMAIN: &str = "schedule-ics";

/// Resolution of the search for offset transitions within a day.
const TRANSITION_STEP_MINUTES: i64 = 15;

#[derive(Debug, Clone)]
pub struct VCalendar {
    pub prodid: String,
    pub version: String,
    pub name: Option<String>,

    pub events: Vec<VEvent>,
    pub timezones: Vec<VTimeZone>,

    pub properties: Vec<parser::Property>,
}

impl VCalendar {
    /// Build a calendar with one event per entry.
    pub fn from_entries(entries: &[ScheduleEntry], options: &Options) -> Result<Self, Error> {
        let events = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                VEvent::from_entry(index, entry, options)
                    .with_context(|| format!("building event for {}", entry.name))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut span: Option<(NaiveDate, NaiveDate)> = None;
        for entry in entries {
            let (from, to) = entry
                .span(options.fallback_count())
                .with_context(|| format!("building event for {}", entry.name))?;

            span = Some(match span {
                Some((acc_from, acc_to)) => (acc_from.min(from), acc_to.max(to)),
                None => (from, to),
            });
        }

        let timezones = match span {
            Some((from, to)) => vec![VTimeZone::for_span(options.timezone, from, to)],
            None => Vec::new(),
        };

        debug!(
            "Built calendar with {} events in {}",
            events.len(),
            options.timezone.name()
        );

        Ok(VCalendar {
            prodid: options.prodid.clone(),
            version: "2.0".to_string(),
            name: options.calendar_name.clone(),
            events,
            timezones,
            properties: vec![
                parser::Property::new("CALSCALE", "GREGORIAN"),
                parser::Property::new("X-WR-TIMEZONE", options.timezone.name()),
            ],
        })
    }

    pub fn to_component(&self) -> Component {
        let mut component = Component::new("VCALENDAR");

        component.push(parser::Property::new("PRODID", escape(&self.prodid)));
        component.push(parser::Property::new("VERSION", self.version.as_str()));
        component.properties.extend(self.properties.iter().cloned());
        if let Some(name) = &self.name {
            component.push(parser::Property::new("X-WR-CALNAME", escape(name)));
        }

        component
            .sub_components
            .extend(self.timezones.iter().map(VTimeZone::to_component));
        component
            .sub_components
            .extend(self.events.iter().map(VEvent::to_component));

        component
    }

    /// Serialize the calendar as the contents of an `.ics` file.
    pub fn to_ics(&self) -> String {
        self.to_component().as_string()
    }

    /// Something to convert between local times in the given zone and
    /// instants.
    ///
    /// IANA names are resolved through the timezone database, anything else
    /// through the calendar's VTIMEZONE components.
    pub fn offseter(&self, tzid: &str) -> Result<Box<dyn Offseter>, Error> {
        if let Ok(tz) = Tz::from_str(tzid) {
            return Ok(Box::new(tz));
        }

        if let Some(tz) = self.timezones.iter().find(|tz| tz.id == tzid) {
            Ok(Box::new(tz.clone()))
        } else {
            bail!("Referenced timezone {} not in calendar", tzid);
        }
    }
}

impl TryFrom<parser::Component> for VCalendar {
    type Error = Error;

    fn try_from(component: parser::Component) -> Result<Self, Self::Error> {
        ensure!(
            component.name.to_ascii_uppercase() == "VCALENDAR",
            "Expected VCALENDAR, found {}",
            component.name
        );

        let mut events = Vec::new();
        let mut timezones = Vec::new();
        for component in component.sub_components {
            match &component.name.to_ascii_uppercase() as &str {
                "VEVENT" => events.push(VEvent::try_from(component).context("parsing VEVENT")?),
                "VTIMEZONE" => {
                    timezones.push(VTimeZone::try_from(component).context("parsing VTIMEZONE")?)
                }
                _ => {}
            }
        }

        let mut prodid = None;
        let mut version = None;
        let mut name = None;

        let mut properties = Vec::new();
        for prop in component.properties {
            match &prop.name.to_ascii_uppercase() as &str {
                "PRODID" => prodid = Some(unescape(&prop.value)?),
                "VERSION" => version = Some(prop.value),
                "X-WR-CALNAME" => name = Some(unescape(&prop.value)?),
                _ => properties.push(prop),
            }
        }

        Ok(VCalendar {
            prodid: prodid.ok_or_else(|| format_err!("Missing PRODID field in VCALENDAR"))?,
            version: version.ok_or_else(|| format_err!("Missing VERSION field in VCALENDAR"))?,
            name,
            events,
            timezones,
            properties,
        })
    }
}

#[derive(Debug, Clone)]
pub struct VEvent {
    pub uid: String,
    pub dtstamp: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateOrDateTime,
    pub end: Option<DateOrDateTime>,
    pub duration: Option<Duration>,
    pub recur: Option<RecurRule>,
    pub exdates: Vec<DateOrDateTime>,
    pub rdates: Vec<DateOrDateTime>,

    pub properties: Vec<parser::Property>,
}

impl VEvent {
    /// Build the event for a schedule entry. `index` is the position of the
    /// entry in its input, and keeps UIDs of otherwise identical entries
    /// apart.
    pub fn from_entry(index: usize, entry: &ScheduleEntry, options: &Options) -> Result<Self, Error> {
        entry.validate()?;

        let tz = options.timezone;
        let tzid = tz.name();
        let at = |date: NaiveDate, time: NaiveTime| {
            DateOrDateTime::DateTime(IcalDateTime::TZ {
                date: date.and_time(time),
                tzid: tzid.to_string(),
            })
        };

        let first = entry.first_occurrence();

        let recur = if entry.is_single() {
            None
        } else {
            let end_condition = match (entry.count, entry.end_date) {
                (Some(count), _) => EndCondition::Count(u64::from(count)),
                (None, Some(end_date)) => {
                    // UNTIL must be in UTC when DTSTART has a TZID.
                    let until = end_date
                        .and_hms_opt(23, 59, 0)
                        .context("computing UNTIL")?;
                    EndCondition::UntilUtc(tz.to_instance(until).with_timezone(&Utc))
                }
                (None, None) => EndCondition::Count(u64::from(options.fallback_count())),
            };

            Some(RecurRule::weekly(
                u64::from(entry.interval),
                entry.weekday,
                end_condition,
            ))
        };

        for date in &entry.exceptions {
            if date.weekday() != entry.weekday {
                warn!(
                    "Exception {} of {} is not on a {:?}",
                    date, entry.name, entry.weekday
                );
            }
        }

        let seed = format!(
            "{}|{}|{}|{}",
            index,
            entry.name,
            first.and_time(entry.start),
            entry.location.as_deref().unwrap_or("")
        );
        let uid = format!(
            "{}@{}",
            Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()),
            UID_DOMAIN
        );

        Ok(VEvent {
            uid,
            dtstamp: Some(options.dtstamp),
            summary: Some(entry.name.clone()),
            description: None,
            location: entry.location.clone(),
            start: at(first, entry.start),
            end: Some(at(first, entry.end)),
            duration: None,
            recur,
            exdates: entry
                .exceptions
                .iter()
                .map(|date| at(*date, entry.start))
                .collect(),
            rdates: entry
                .rdates
                .iter()
                .map(|date| at(*date, entry.start))
                .collect(),
            properties: Vec::new(),
        })
    }

    pub fn to_component(&self) -> Component {
        let mut component = Component::new("VEVENT");

        component.push(parser::Property::new("UID", self.uid.as_str()));
        if let Some(dtstamp) = self.dtstamp {
            component.push(DateOrDateTime::DateTime(IcalDateTime::Utc(dtstamp)).to_property("DTSTAMP"));
        }
        component.push(self.start.to_property("DTSTART"));
        if let Some(end) = &self.end {
            component.push(end.to_property("DTEND"));
        }
        if let Some(duration) = self.duration {
            component.push(parser::Property::new("DURATION", format_duration(duration)));
        }
        if let Some(recur) = &self.recur {
            component.push(parser::Property::new("RRULE", recur.to_string()));
        }
        for exdate in &self.exdates {
            component.push(exdate.to_property("EXDATE"));
        }
        for rdate in &self.rdates {
            component.push(rdate.to_property("RDATE"));
        }
        if let Some(summary) = &self.summary {
            component.push(parser::Property::new("SUMMARY", escape(summary)));
        }
        if let Some(location) = &self.location {
            component.push(parser::Property::new("LOCATION", escape(location)));
        }
        if let Some(description) = &self.description {
            component.push(parser::Property::new("DESCRIPTION", escape(description)));
        }
        component.properties.extend(self.properties.iter().cloned());

        component
    }

    /// Whether the event is for a full day.
    pub fn is_full_day_event(&self) -> bool {
        matches!(self.start, DateOrDateTime::Date(_))
    }

    /// How long each instance of the event lasts.
    pub fn duration(&self) -> Result<Duration, Error> {
        if let Some(duration) = self.duration {
            return Ok(duration);
        }

        match (&self.start, &self.end) {
            (DateOrDateTime::Date(start), Some(DateOrDateTime::Date(end))) => Ok(*end - *start),
            (DateOrDateTime::DateTime(start), Some(DateOrDateTime::DateTime(end))) => end
                .sub(start)
                .with_context(|| format!("calculating duration for {}", self.uid)),
            (DateOrDateTime::Date(_), None) => Ok(Duration::days(1)),
            (DateOrDateTime::DateTime(_), None) => Ok(Duration::zero()),
            _ => bail!("VEVENT has different types for DTSTART and DTEND"),
        }
    }

    /// Get an iterator over the start of every instance of the event, as
    /// wall clock times in the zone of DTSTART. All day events start at
    /// midnight.
    ///
    /// Note: This may be an infinite iterator if the event recurs forever.
    pub fn recur_iter(
        &self,
        calendar: &VCalendar,
    ) -> Result<Box<dyn Iterator<Item = NaiveDateTime>>, Error> {
        let offseter: Box<dyn Offseter> = match self.start.tzid() {
            Some(tzid) => calendar.offseter(tzid)?,
            None => Box::new(Utc.fix()),
        };

        let start = match &self.start {
            DateOrDateTime::Date(date) => date.and_time(NaiveTime::MIN),
            DateOrDateTime::DateTime(date) => date.to_local(offseter.as_ref()),
        };

        let localize = |date: &IcalDateTime| -> Result<NaiveDateTime, Error> {
            match date {
                IcalDateTime::TZ { date, tzid } if Some(tzid.as_str()) != self.start.tzid() => {
                    let instant = calendar.offseter(tzid)?.to_instance(*date);
                    Ok(offseter.from_instance(instant))
                }
                date => Ok(date.to_local(offseter.as_ref())),
            }
        };

        let rdates = self
            .rdates
            .iter()
            .map(|rdate| match rdate {
                DateOrDateTime::Date(date) => Ok(date.and_time(start.time())),
                DateOrDateTime::DateTime(date) => localize(date),
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let exclusions = self
            .exdates
            .iter()
            .map(|exdate| match exdate {
                DateOrDateTime::Date(date) => Ok(Exclusion::Day(*date)),
                DateOrDateTime::DateTime(date) => localize(date).map(Exclusion::At),
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let instances: Box<dyn Iterator<Item = NaiveDateTime>> = match &self.recur {
            Some(recur) => Box::new(recur.from_date(start, offseter.as_ref())),
            None => Box::new(iter::once(start)),
        };

        Ok(Box::new(with_extras(instances, rdates, exclusions)))
    }
}

impl TryFrom<parser::Component> for VEvent {
    type Error = Error;

    fn try_from(component: parser::Component) -> Result<Self, Self::Error> {
        ensure!(component.name.to_ascii_uppercase() == "VEVENT");

        let mut uid = None;
        let mut dtstamp = None;
        let mut recur = None;
        let mut start = None;
        let mut end = None;
        let mut duration = None;
        let mut rdates = Vec::new();
        let mut exdates = Vec::new();
        let mut summary = None;
        let mut description = None;
        let mut location = None;

        let mut properties = Vec::new();
        for prop in component.properties {
            match &prop.name.to_ascii_uppercase() as &str {
                "UID" => uid = Some(prop.value),
                "DTSTAMP" => match DateOrDateTime::parse_from(&prop.value, &prop)? {
                    DateOrDateTime::DateTime(IcalDateTime::Utc(date)) => dtstamp = Some(date),
                    _ => bail!("DTSTAMP must be in UTC"),
                },
                "DTSTART" => start = Some(DateOrDateTime::parse_from(&prop.value, &prop)?),
                "DTEND" => end = Some(DateOrDateTime::parse_from(&prop.value, &prop)?),
                "DURATION" => duration = Some(parse_duration(&prop.value)?),
                "RRULE" => recur = Some(RecurRule::from_str(&prop.value)?),
                "RDATE" => rdates.extend(DateOrDateTime::parse_list(&prop)?),
                "EXDATE" => exdates.extend(DateOrDateTime::parse_list(&prop)?),
                "SUMMARY" => summary = Some(unescape(&prop.value)?),
                "DESCRIPTION" => description = Some(unescape(&prop.value)?),
                "LOCATION" => location = Some(unescape(&prop.value)?),
                _ => properties.push(prop),
            }
        }

        let uid = uid.ok_or_else(|| format_err!("Missing UID field in VEVENT"))?;
        let start = start.ok_or_else(|| format_err!("Missing DTSTART field in {}", uid))?;

        if duration.is_some() && end.is_some() {
            bail!("VEVENT has both DURATION and DTEND");
        }

        if let Some(end) = &end {
            match (&start, end) {
                (DateOrDateTime::Date(_), DateOrDateTime::Date(_))
                | (DateOrDateTime::DateTime(_), DateOrDateTime::DateTime(_)) => {}
                _ => bail!("VEVENT has different types for DTSTART and DTEND"),
            }
        }

        Ok(VEvent {
            uid,
            dtstamp,
            summary,
            description,
            location,
            start,
            end,
            duration,
            recur,
            exdates,
            rdates,
            properties,
        })
    }
}

/// One observance (STANDARD or DAYLIGHT) of a timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetRule {
    pub offset_from: FixedOffset,
    pub offset_to: FixedOffset,
    /// Local time, in `offset_from`, at which the observance begins.
    pub start: NaiveDateTime,
    pub name: Option<String>,
    pub properties: Vec<parser::Property>,
}

impl OffsetRule {
    /// The instant the observance begins, as a UTC date time.
    fn onset_utc(&self) -> NaiveDateTime {
        self.start - Duration::seconds(i64::from(self.offset_from.local_minus_utc()))
    }

    fn to_component(&self, kind: &str) -> Component {
        let mut component = Component::new(kind);

        component.push(DateOrDateTime::DateTime(IcalDateTime::Local(self.start)).to_property("DTSTART"));
        component.push(parser::Property::new("TZOFFSETFROM", format_offset(self.offset_from)));
        component.push(parser::Property::new("TZOFFSETTO", format_offset(self.offset_to)));
        if let Some(name) = &self.name {
            component.push(parser::Property::new("TZNAME", escape(name)));
        }
        component.properties.extend(self.properties.iter().cloned());

        component
    }
}

impl TryFrom<parser::Component> for OffsetRule {
    type Error = Error;

    fn try_from(component: parser::Component) -> Result<Self, Self::Error> {
        ensure!(
            &component.name.to_ascii_uppercase() == "DAYLIGHT"
                || &component.name.to_ascii_uppercase() == "STANDARD"
        );

        if !component.sub_components.is_empty() {
            bail!("Neither DAYLIGHT nor STANDARD can have sub components");
        }

        let mut offset_from = None;
        let mut offset_to = None;
        let mut start = None;
        let mut name = None;

        let mut properties = Vec::new();
        for prop in component.properties {
            match &prop.name.to_ascii_uppercase() as &str {
                "TZOFFSETFROM" => offset_from = Some(parse_offset(&prop.value)?),
                "TZOFFSETTO" => offset_to = Some(parse_offset(&prop.value)?),
                "DTSTART" => {
                    if let DateOrDateTime::DateTime(IcalDateTime::Local(datetime)) =
                        DateOrDateTime::parse_from(&prop.value, &prop)?
                    {
                        start = Some(datetime)
                    } else {
                        bail!("Invalid timezone start time, must be local time")
                    }
                }
                "TZNAME" => name = Some(unescape(&prop.value)?),
                _ => properties.push(prop),
            }
        }

        Ok(OffsetRule {
            offset_from: offset_from
                .ok_or_else(|| format_err!("Missing TZOFFSETFROM field in offset rule"))?,
            offset_to: offset_to
                .ok_or_else(|| format_err!("Missing TZOFFSETTO field in offset rule"))?,
            start: start.ok_or_else(|| format_err!("Missing DTSTART field in offset rule"))?,
            name,
            properties,
        })
    }
}

/// A timezone definition, as a list of observances with fixed start times.
///
/// Observances with their own RRULE are kept as parsed but their recurrence
/// is not expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct VTimeZone {
    pub id: String,
    pub standard: Vec<OffsetRule>,
    pub daylight: Vec<OffsetRule>,

    pub properties: Vec<parser::Property>,
}

impl VTimeZone {
    /// Describe the offsets `tz` uses between the two dates.
    ///
    /// The first observance starts at the beginning of the span; every
    /// change of offset within it adds another. The zone is sampled once a
    /// day, and only days whose offset changes are searched in finer steps.
    pub fn for_span(tz: Tz, from: NaiveDate, to: NaiveDate) -> VTimeZone {
        let step = Duration::minutes(TRANSITION_STEP_MINUTES);
        let day = Duration::days(1);
        let first = (from - Duration::days(1)).and_time(NaiveTime::MIN);
        let last = (to + Duration::days(2)).and_time(NaiveTime::MIN);

        let mut standard = Vec::new();
        let mut daylight = Vec::new();

        let mut current = tz.offset_from_utc_datetime(&first);
        let initial = OffsetRule {
            offset_from: current.fix(),
            offset_to: current.fix(),
            start: first + current.fix(),
            name: Some(current.to_string()),
            properties: Vec::new(),
        };
        if is_dst(&current) {
            daylight.push(initial);
        } else {
            standard.push(initial);
        }

        let mut day_start = first;
        while day_start < last {
            let day_end = day_start + day;

            if changes(&current, &tz.offset_from_utc_datetime(&day_end)) {
                let mut utc = day_start + step;
                while utc <= day_end {
                    let next = tz.offset_from_utc_datetime(&utc);

                    if changes(&current, &next) {
                        let rule = OffsetRule {
                            offset_from: current.fix(),
                            offset_to: next.fix(),
                            start: utc + current.fix(),
                            name: Some(next.to_string()),
                            properties: Vec::new(),
                        };

                        if is_dst(&next) {
                            daylight.push(rule);
                        } else {
                            standard.push(rule);
                        }

                        current = next;
                    }

                    utc += step;
                }
            }

            day_start = day_end;
        }

        VTimeZone {
            id: tz.name().to_string(),
            standard,
            daylight,
            properties: Vec::new(),
        }
    }

    /// All observances, ordered by when they begin.
    fn observances(&self) -> Vec<&OffsetRule> {
        let mut observances: Vec<_> = self.standard.iter().chain(self.daylight.iter()).collect();
        observances.sort_by_key(|rule| rule.onset_utc());
        observances
    }

    pub fn to_component(&self) -> Component {
        let mut component = Component::new("VTIMEZONE");

        component.push(parser::Property::new("TZID", self.id.as_str()));
        component.properties.extend(self.properties.iter().cloned());

        for rule in self.observances() {
            let kind = if self.daylight.contains(rule) {
                "DAYLIGHT"
            } else {
                "STANDARD"
            };
            component.sub_components.push(rule.to_component(kind));
        }

        component
    }
}

fn is_dst(offset: &chrono_tz::TzOffset) -> bool {
    offset.dst_offset() != Duration::zero()
}

fn changes(current: &chrono_tz::TzOffset, next: &chrono_tz::TzOffset) -> bool {
    next.fix() != current.fix() || is_dst(next) != is_dst(current)
}

impl Offseter for VTimeZone {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset> {
        let observances = self.observances();

        let offset = observances
            .iter()
            .rev()
            .find(|rule| rule.start <= d)
            .map(|rule| rule.offset_to)
            .or_else(|| observances.first().map(|rule| rule.offset_from))
            .unwrap_or_else(|| Utc.fix());

        offset.to_instance(d)
    }

    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime {
        let observances = self.observances();
        let utc = d.naive_utc();

        let offset = observances
            .iter()
            .rev()
            .find(|rule| rule.onset_utc() <= utc)
            .map(|rule| rule.offset_to)
            .or_else(|| observances.first().map(|rule| rule.offset_from))
            .unwrap_or_else(|| Utc.fix());

        utc + offset
    }
}

impl TryFrom<parser::Component> for VTimeZone {
    type Error = Error;

    fn try_from(component: parser::Component) -> Result<Self, Self::Error> {
        ensure!(component.name.to_ascii_uppercase() == "VTIMEZONE");

        let mut standard = Vec::new();
        let mut daylight = Vec::new();
        for component in component.sub_components {
            match &component.name.to_ascii_uppercase() as &str {
                "STANDARD" => standard.push(OffsetRule::try_from(component)?),
                "DAYLIGHT" => daylight.push(OffsetRule::try_from(component)?),
                _ => {}
            }
        }

        if standard.is_empty() && daylight.is_empty() {
            bail!("VTIMEZONE must have one of DAYLIGHT or STANDARD components");
        }

        let mut id = None;
        let mut properties = Vec::new();
        for prop in component.properties {
            match &prop.name.to_ascii_uppercase() as &str {
                "TZID" => id = Some(prop.value),
                _ => properties.push(prop),
            }
        }

        Ok(VTimeZone {
            id: id.ok_or_else(|| format_err!("Missing TZID field in VTIMEZONE"))?,
            standard,
            daylight,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn options() -> Options {
        Options {
            dtstamp: date(2024, 8, 1).and_hms_opt(0, 0, 0).unwrap().and_utc(),
            ..Options::default()
        }
    }

    fn entry() -> ScheduleEntry {
        ScheduleEntry {
            name: "COMP2119, Lecture".to_string(),
            weekday: Weekday::Tue,
            start: time(9, 30),
            end: time(11, 20),
            location: Some("CYP-107".to_string()),
            start_date: date(2024, 9, 2),
            end_date: Some(date(2024, 11, 30)),
            count: None,
            interval: 1,
            exceptions: vec![date(2024, 10, 15)].into_iter().collect(),
            rdates: vec![date(2024, 12, 5)].into_iter().collect(),
        }
    }

    #[test]
    fn test_event_from_entry() -> Result<(), Error> {
        let event = VEvent::from_entry(0, &entry(), &options())?;
        let text = event.to_component().as_string();

        assert!(text.contains("DTSTART;TZID=Asia/Hong_Kong:20240903T093000\r\n"), "{}", text);
        assert!(text.contains("DTEND;TZID=Asia/Hong_Kong:20240903T112000\r\n"));
        // 23:59 on the 30th of November in Hong Kong is 15:59 UTC.
        assert!(text.contains("RRULE:FREQ=WEEKLY;BYDAY=TU;UNTIL=20241130T155900Z\r\n"));
        assert!(text.contains("EXDATE;TZID=Asia/Hong_Kong:20241015T093000\r\n"));
        assert!(text.contains("RDATE;TZID=Asia/Hong_Kong:20241205T093000\r\n"));
        assert!(text.contains("SUMMARY:COMP2119\\, Lecture\r\n"));
        assert!(text.contains("LOCATION:CYP-107\r\n"));
        assert!(text.contains("DTSTAMP:20240801T000000Z\r\n"));
        assert!(event.uid.ends_with("@schedule-ics"));

        Ok(())
    }

    #[test]
    fn test_event_end_conditions() -> Result<(), Error> {
        let mut e = entry();
        e.count = Some(12);
        e.interval = 2;
        let event = VEvent::from_entry(0, &e, &options())?;
        assert_eq!(
            event.recur.unwrap().to_string(),
            "FREQ=WEEKLY;INTERVAL=2;BYDAY=TU;COUNT=12"
        );

        let mut e = entry();
        e.end_date = None;
        let event = VEvent::from_entry(0, &e, &options())?;
        assert_eq!(event.recur.unwrap().to_string(), "FREQ=WEEKLY;BYDAY=TU;COUNT=30");

        let e = ScheduleEntry::single("Exam".to_string(), date(2024, 12, 12), time(14, 0), time(16, 0), None);
        let event = VEvent::from_entry(0, &e, &options())?;
        assert!(event.recur.is_none());
        assert!(!event.to_component().as_string().contains("RRULE"));

        Ok(())
    }

    #[test]
    fn test_uid_is_stable() -> Result<(), Error> {
        let first = VEvent::from_entry(3, &entry(), &options())?;
        let second = VEvent::from_entry(3, &entry(), &Options::default())?;
        let other = VEvent::from_entry(4, &entry(), &options())?;

        assert_eq!(first.uid, second.uid);
        assert_ne!(first.uid, other.uid);

        Ok(())
    }

    #[test]
    fn test_recur_iter() -> Result<(), Error> {
        let calendar = VCalendar::from_entries(&[entry()], &options())?;
        let event = &calendar.events[0];

        let instances: Vec<_> = event.recur_iter(&calendar)?.collect();

        // Thirteen Tuesdays from the 3rd of September to the 26th of
        // November, less one exception, plus one extra date.
        assert_eq!(instances.len(), 13);
        assert_eq!(instances[0], date(2024, 9, 3).and_time(time(9, 30)));
        assert!(!instances.contains(&date(2024, 10, 15).and_time(time(9, 30))));
        assert_eq!(instances[11], date(2024, 11, 26).and_time(time(9, 30)));
        assert_eq!(instances[12], date(2024, 12, 5).and_time(time(9, 30)));

        assert_eq!(event.duration()?, Duration::minutes(110));

        Ok(())
    }

    #[test]
    fn test_fixed_offset_zone() {
        let tz = VTimeZone::for_span(chrono_tz::Asia::Hong_Kong, date(2024, 9, 2), date(2024, 12, 31));

        assert_eq!(tz.id, "Asia/Hong_Kong");
        assert!(tz.daylight.is_empty());
        assert_eq!(tz.standard.len(), 1);
        assert_eq!(format_offset(tz.standard[0].offset_to), "+0800");
    }

    #[test]
    fn test_zone_with_transitions() {
        let tz = VTimeZone::for_span(chrono_tz::Europe::London, date(2024, 1, 8), date(2024, 12, 20));

        assert_eq!(tz.daylight.len(), 1);
        assert_eq!(tz.standard.len(), 2);

        let spring = &tz.daylight[0];
        assert_eq!(spring.start, date(2024, 3, 31).and_hms_opt(1, 0, 0).unwrap());
        assert_eq!(format_offset(spring.offset_from), "+0000");
        assert_eq!(format_offset(spring.offset_to), "+0100");

        let autumn = &tz.standard[1];
        assert_eq!(autumn.start, date(2024, 10, 27).and_hms_opt(2, 0, 0).unwrap());
        assert_eq!(format_offset(autumn.offset_to), "+0000");

        // Offset lookups through the observances agree with the database.
        let summer = date(2024, 7, 1).and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(tz.to_instance(summer).offset().local_minus_utc(), 3600);
        let winter = date(2024, 12, 1).and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(tz.to_instance(winter).offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_zone_over_a_decade() {
        let tz = VTimeZone::for_span(chrono_tz::Europe::London, date(2024, 1, 8), date(2033, 12, 20));

        assert_eq!(tz.daylight.len(), 10);
        assert_eq!(tz.standard.len(), 11);
        assert_eq!(
            tz.daylight[9].start,
            date(2033, 3, 27).and_hms_opt(1, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_calendar_rejects_out_of_range_entries() {
        let mut e = entry();
        e.count = Some(20_000_000);
        let err = VCalendar::from_entries(&[e], &options()).unwrap_err();
        assert!(format!("{:#}", err).contains("COMP2119, Lecture"), "{:#}", err);

        let mut e = entry();
        e.end_date = Some(date(9999, 12, 31));
        assert!(VCalendar::from_entries(&[e], &options()).is_err());
    }

    #[test]
    fn test_entry_without_occurrences_is_rejected() {
        let mut e = entry();
        e.start_date = date(2024, 11, 27);
        e.end_date = Some(date(2024, 11, 30));
        e.exceptions.clear();

        // The first Tuesday on or after the 27th is the 3rd of December.
        assert!(VEvent::from_entry(0, &e, &options()).is_err());
    }

    #[test]
    fn test_calendar_reads_back() -> Result<(), Error> {
        let options = Options {
            calendar_name: Some("Fall, 2024".to_string()),
            ..options()
        };
        let calendar = VCalendar::from_entries(&[entry()], &options)?;

        let components = Component::from_str_to_stream(&calendar.to_ics())?;
        let parsed = VCalendar::try_from(components.into_iter().next().unwrap())?;

        assert_eq!(parsed.prodid, options.prodid);
        assert_eq!(parsed.version, "2.0");
        assert_eq!(parsed.name.as_deref(), Some("Fall, 2024"));
        assert_eq!(parsed.timezones, calendar.timezones);
        assert_eq!(parsed.events.len(), 1);

        let event = &parsed.events[0];
        assert_eq!(event.uid, calendar.events[0].uid);
        assert_eq!(event.summary.as_deref(), Some("COMP2119, Lecture"));
        assert_eq!(event.recur, calendar.events[0].recur);
        assert_eq!(event.exdates, calendar.events[0].exdates);
        assert_eq!(event.rdates, calendar.events[0].rdates);

        Ok(())
    }

    #[test]
    fn test_event_requires_uid_and_start() {
        let mut component = Component::new("VEVENT");
        component.push(parser::Property::new("DTSTART", "20240903T093000"));
        assert!(VEvent::try_from(component.clone()).is_err());

        let mut component = Component::new("VEVENT");
        component.push(parser::Property::new("UID", "1"));
        assert!(VEvent::try_from(component).is_err());
    }

    #[test]
    fn test_floating_event_with_date_exclusion() -> Result<(), Error> {
        let mut component = Component::new("VEVENT");
        component.push(parser::Property::new("UID", "floating"));
        component.push(parser::Property::new("DTSTART", "20240902T080000"));
        component.push(parser::Property::new("DURATION", "PT45M"));
        component.push(parser::Property::new("RRULE", "FREQ=DAILY;COUNT=3"));
        component.push(
            parser::Property::new("EXDATE", "20240903").with_parameter("VALUE", "DATE"),
        );

        let event = VEvent::try_from(component)?;
        let calendar = VCalendar {
            prodid: "-//Test//EN".to_string(),
            version: "2.0".to_string(),
            name: None,
            events: Vec::new(),
            timezones: Vec::new(),
            properties: Vec::new(),
        };

        let instances: Vec<_> = event.recur_iter(&calendar)?.collect();
        assert_eq!(
            instances,
            vec![
                date(2024, 9, 2).and_time(time(8, 0)),
                date(2024, 9, 4).and_time(time(8, 0)),
            ]
        );
        assert_eq!(event.duration()?, Duration::minutes(45));

        Ok(())
    }
}
