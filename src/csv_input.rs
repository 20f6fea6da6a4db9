//! Reading schedule entries from CSV files.
//!
//! Recognised columns are `name, weekday, start, end, location, start_date,
//! end_date, count, interval, exceptions, rdates` plus `date` for one-off
//! events. Column names are case insensitive.

use std::{collections::HashMap, fs::File, io::Read, path::Path};

use anyhow::{bail, ensure, format_err, Context, Error};
use tracing::{debug, info};

use crate::{
    config::Options,
    schedule::{parse_date, parse_date_list, parse_time, parse_weekday, ScheduleEntry, DEFAULT_NAME},
};

const REQUIRED_COLUMNS: [&str; 3] = ["name", "start", "end"];

type Row = HashMap<String, String>;

pub fn read_entries_from_path(path: &Path, options: &Options) -> Result<Vec<ScheduleEntry>, Error> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    read_entries(file, options).with_context(|| format!("reading {}", path.display()))
}

pub fn read_entries<R: Read>(reader: R, options: &Options) -> Result<Vec<ScheduleEntry>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
        .collect();

    let missing: Vec<_> = REQUIRED_COLUMNS
        .iter()
        .filter(|column| !headers.iter().any(|h| h == *column))
        .copied()
        .collect();
    if !missing.is_empty() {
        bail!(
            "CSV missing columns: {}. Always required: {}",
            missing.join(", "),
            REQUIRED_COLUMNS.join(", ")
        );
    }

    let mut entries = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let row_number = index + 1;
        let record = record.with_context(|| format!("reading CSV row {}", row_number))?;

        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        let row: Row = headers
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect();

        let entry = parse_row(&row, options).with_context(|| format!("parsing CSV row {}", row_number))?;
        debug!(
            row = row_number,
            name = %entry.name,
            weekday = ?entry.weekday,
            "Parsed schedule entry"
        );

        entries.push(entry);
    }

    ensure!(!entries.is_empty(), "No schedule entries in CSV");

    info!("Read {} schedule entries from CSV", entries.len());

    Ok(entries)
}

/// A trimmed, non-empty field of the row.
fn field<'a>(row: &'a Row, name: &str) -> Option<&'a str> {
    row.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn required<'a>(row: &'a Row, name: &str) -> Result<&'a str, Error> {
    field(row, name).ok_or_else(|| format_err!("Missing value for '{}'", name))
}

fn parse_row(row: &Row, options: &Options) -> Result<ScheduleEntry, Error> {
    let name = field(row, "name").unwrap_or(DEFAULT_NAME).to_string();
    let location = field(row, "location").map(str::to_string);
    let start = parse_time(required(row, "start")?)?;
    let end = parse_time(required(row, "end")?)?;

    if let Some(date) = field(row, "date") {
        let entry = ScheduleEntry::single(name, parse_date(date)?, start, end, location);
        entry.validate()?;
        return Ok(entry);
    }

    let weekday = field(row, "weekday")
        .ok_or_else(|| format_err!("Recurring row requires 'weekday'"))
        .and_then(parse_weekday)?;

    let start_date = match field(row, "start_date") {
        Some(text) => parse_date(text)?,
        None => options
            .term_start
            .ok_or_else(|| format_err!("Recurring row requires 'start_date'"))?,
    };

    let end_date = field(row, "end_date").map(parse_date).transpose()?;

    let interval = match field(row, "interval") {
        Some(text) => text
            .parse::<u32>()
            .with_context(|| format!("Invalid interval: '{}'", text))?,
        None => 1,
    };

    let count = field(row, "count")
        .map(|text| {
            text.parse::<u32>()
                .with_context(|| format!("Invalid count: '{}'", text))
        })
        .transpose()?;

    let count = match (count, end_date) {
        (Some(count), Some(_)) => {
            debug!("Row has both count and end_date, using count");
            Some(count)
        }
        (Some(count), None) => Some(count),
        (None, Some(_)) => None,
        (None, None) => Some(options.fallback_count()),
    };

    let entry = ScheduleEntry {
        name,
        weekday,
        start,
        end,
        location,
        start_date,
        end_date,
        count,
        interval,
        exceptions: field(row, "exceptions").map(parse_date_list).unwrap_or_default(),
        rdates: field(row, "rdates").map(parse_date_list).unwrap_or_default(),
    };

    entry.validate()?;
    entry.span(options.fallback_count())?;

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, Weekday};

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_full_row() -> Result<(), Error> {
        let data = "\u{feff}Name,Weekday,Start,End,Location,Start_Date,End_Date,Count,Interval,Exceptions,RDates\n\
                    COMP2119,Tue,9:30,11:20,\"CYP-107, Main\",2024-09-02,2024-11-30,,2,\"2024-10-01, 2024-10-15\",2024-12-03\n";

        let entries = read_entries(data.as_bytes(), &Options::default())?;
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.name, "COMP2119");
        assert_eq!(entry.weekday, Weekday::Tue);
        assert_eq!(entry.start, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(entry.end, NaiveTime::from_hms_opt(11, 20, 0).unwrap());
        assert_eq!(entry.location.as_deref(), Some("CYP-107, Main"));
        assert_eq!(entry.start_date, date(2024, 9, 2));
        assert_eq!(entry.end_date, Some(date(2024, 11, 30)));
        assert_eq!(entry.count, None);
        assert_eq!(entry.interval, 2);
        assert_eq!(
            entry.exceptions.iter().copied().collect::<Vec<_>>(),
            vec![date(2024, 10, 1), date(2024, 10, 15)]
        );
        assert_eq!(entry.rdates.iter().copied().collect::<Vec<_>>(), vec![date(2024, 12, 3)]);

        Ok(())
    }

    #[test]
    fn test_defaults() -> Result<(), Error> {
        let data = "name,weekday,start,end,location,start_date\n\
                    ,周三,14:00,15:50,,2024-09-02\n";

        let entries = read_entries(data.as_bytes(), &Options::default())?;
        let entry = &entries[0];

        assert_eq!(entry.name, "Course");
        assert_eq!(entry.location, None);
        assert_eq!(entry.interval, 1);
        assert_eq!(entry.count, Some(30));
        assert!(entry.exceptions.is_empty());

        Ok(())
    }

    #[test]
    fn test_term_defaults_from_options() -> Result<(), Error> {
        let data = "name,weekday,start,end,location\n\
                    ECON1210,Thu,10:30,12:20,KK101\n";

        let options = Options {
            term_start: Some(date(2024, 9, 2)),
            weeks: Some(13),
            ..Options::default()
        };

        let entries = read_entries(data.as_bytes(), &options)?;
        assert_eq!(entries[0].start_date, date(2024, 9, 2));
        assert_eq!(entries[0].count, Some(13));

        Ok(())
    }

    #[test]
    fn test_count_wins_over_end_date() -> Result<(), Error> {
        let data = "name,weekday,start,end,start_date,end_date,count\n\
                    A,Mon,9:00,10:00,2024-09-02,2024-12-01,5\n";

        let entries = read_entries(data.as_bytes(), &Options::default())?;
        assert_eq!(entries[0].count, Some(5));
        assert_eq!(entries[0].end_date, Some(date(2024, 12, 1)));

        Ok(())
    }

    #[test]
    fn test_single_date_row() -> Result<(), Error> {
        let data = "name,start,end,location,date,weekday,start_date\n\
                    Final Exam,14:30,16:30,Hall,12/12/2024,,\n\
                    Lecture,9:00,10:00,,,Fri,2024-09-02\n";

        let entries = read_entries(data.as_bytes(), &Options::default())?;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_single());
        assert_eq!(entries[0].start_date, date(2024, 12, 12));
        assert!(!entries[1].is_single());

        Ok(())
    }

    #[test]
    fn test_missing_columns() {
        let data = "name,weekday,location\nA,Mon,Room\n";
        let err = read_entries(data.as_bytes(), &Options::default()).unwrap_err();

        assert!(err.to_string().contains("start, end"), "{}", err);
    }

    #[test]
    fn test_bad_rows_report_row_number() {
        let cases = [
            "name,weekday,start,end,start_date\nA,Mon,9:00,10:00,2024-09-02\nB,Funday,9:00,10:00,2024-09-02\n",
            "name,weekday,start,end,start_date\nA,Mon,9:00,10:00,2024-09-02\nB,Mon,11:00,10:00,2024-09-02\n",
            "name,weekday,start,end,start_date\nA,Mon,9:00,10:00,2024-09-02\nB,Mon,9:00,10:00,\n",
            "name,weekday,start,end,start_date,count\nA,Mon,9:00,10:00,2024-09-02,\nB,Mon,9:00,10:00,2024-09-02,many\n",
        ];

        for data in &cases {
            let err = read_entries(data.as_bytes(), &Options::default()).unwrap_err();
            assert!(format!("{:#}", err).contains("row 2"), "{:#}", err);
        }
    }

    #[test]
    fn test_out_of_range_rows() {
        for data in &[
            "name,weekday,start,end,start_date,count\nA,Mon,9:00,10:00,2024-09-02,20000000\n",
            "name,weekday,start,end,start_date,count,interval\nA,Mon,9:00,10:00,2024-09-02,3,4294967295\n",
            "name,weekday,start,end,start_date,end_date\nA,Mon,9:00,10:00,2024-09-02,9999-12-31\n",
        ] {
            let err = read_entries(data.as_bytes(), &Options::default()).unwrap_err();
            assert!(format!("{:#}", err).contains("row 1"), "{:#}", err);
        }
    }

    #[test]
    fn test_end_date_before_first_weekday() {
        // The 2nd of September 2024 is a Monday, so the first Friday is the 6th.
        let data = "name,weekday,start,end,start_date,end_date\nA,Fri,9:00,10:00,2024-09-02,2024-09-05\n";
        assert!(read_entries(data.as_bytes(), &Options::default()).is_err());
    }

    #[test]
    fn test_empty_csv() {
        let data = "name,weekday,start,end\n\n";
        assert!(read_entries(data.as_bytes(), &Options::default()).is_err());
    }
}
