//! Reading schedule entries from DOCX teaching plans.
//!
//! A teaching plan lists every session of a course on its own line (or table
//! row), e.g. `COMP2119 Class A  2024-09-03  09:30-11:20  Venue: CYP-107`.
//! Sessions of the same class in the same weekly slot are folded into a
//! single weekly entry, with the weeks that have no session as exceptions.

use std::{
    collections::BTreeSet,
    fs::File,
    io::{Read, Seek},
    path::Path,
};

use anyhow::{ensure, Context, Error};
use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use itertools::Itertools;
use quick_xml::{events::Event, Reader};
use regex::Regex;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::schedule::{parse_date, parse_time, ScheduleEntry};

const DOCUMENT_PATH: &str = "word/document.xml";

pub fn read_entries_from_path(path: &Path) -> Result<Vec<ScheduleEntry>, Error> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    read_entries(file).with_context(|| format!("reading {}", path.display()))
}

pub fn read_entries<R: Read + Seek>(reader: R) -> Result<Vec<ScheduleEntry>, Error> {
    let lines = read_lines(reader)?;
    debug!("Read {} lines from document", lines.len());

    extract_entries(&lines)
}

/// The text of the document, one line per paragraph or table row.
pub fn read_lines<R: Read + Seek>(reader: R) -> Result<Vec<String>, Error> {
    let mut archive = ZipArchive::new(reader).context("opening DOCX as ZIP")?;

    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PATH)
        .with_context(|| format!("DOCX has no {}", DOCUMENT_PATH))?
        .read_to_string(&mut xml)?;

    document_lines(&xml)
}

#[derive(Default)]
struct LineCollector {
    lines: Vec<String>,
    paragraph: String,
    cells: Vec<String>,
    cell: String,
    table_depth: u32,
    in_run: bool,
    in_text: bool,
}

impl LineCollector {
    fn end_paragraph(&mut self) {
        let paragraph = std::mem::take(&mut self.paragraph);
        let paragraph = paragraph.trim();

        if self.table_depth > 0 {
            if !paragraph.is_empty() {
                if !self.cell.is_empty() {
                    self.cell.push(' ');
                }
                self.cell.push_str(paragraph);
            }
        } else if !paragraph.is_empty() {
            self.lines.push(paragraph.to_string());
        }
    }

    fn end_cell(&mut self) {
        if self.table_depth == 1 {
            let cell = std::mem::take(&mut self.cell);
            self.cells.push(cell);
        }
    }

    fn end_row(&mut self) {
        if self.table_depth == 1 {
            let cells = std::mem::take(&mut self.cells);
            if cells.iter().any(|c| !c.is_empty()) {
                self.lines.push(cells.join("\t"));
            }
        }
    }
}

fn document_lines(xml: &str) -> Result<Vec<String>, Error> {
    let mut reader = Reader::from_str(xml);
    let mut collector = LineCollector::default();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"tbl" => collector.table_depth += 1,
                b"r" => collector.in_run = true,
                b"t" => collector.in_text = true,
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"tbl" => collector.table_depth = collector.table_depth.saturating_sub(1),
                b"tr" => collector.end_row(),
                b"tc" => collector.end_cell(),
                b"p" => collector.end_paragraph(),
                b"r" => collector.in_run = false,
                b"t" => collector.in_text = false,
                _ => {}
            },
            Event::Empty(e) if collector.in_run => match e.local_name().as_ref() {
                b"tab" => collector.paragraph.push('\t'),
                b"br" | b"cr" => collector.paragraph.push(' '),
                _ => {}
            },
            Event::Text(e) if collector.in_text => {
                collector.paragraph.push_str(&e.unescape()?);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(collector.lines)
}

struct Patterns {
    token: Regex,
    date: Regex,
    time: Regex,
    venue: Regex,
}

impl Patterns {
    fn new() -> Result<Patterns, Error> {
        Ok(Patterns {
            token: Regex::new(
                r"\b(?P<code>[A-Z]{2,5}\s?\d{3,5}[A-Z]?)\b[\s,:/()\-]*(?P<label>(?i:class|section|group)\s*[A-Za-z0-9]{1,4})\b",
            )?,
            date: Regex::new(r"\b(\d{4}[-/.]\d{1,2}[-/.]\d{1,2}|\d{1,2}[-/.]\d{1,2}[-/.]\d{4})\b")?,
            time: Regex::new(r"(\d{1,2}:\d{2})\s*(?:-|–|—|~|to)\s*(\d{1,2}:\d{2})")?,
            venue: Regex::new(r"(?i)\b(?:venue|room|location|classroom)\s*[:：]\s*([^\t]+)")?,
        })
    }
}

/// One dated meeting of a class found in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    name: String,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    location: Option<String>,
}

impl Session {
    /// Sessions of the same class share a key, however the label is cased.
    fn key(&self) -> String {
        self.name.to_lowercase()
    }
}

fn parse_session(line: &str, patterns: &Patterns) -> Option<Session> {
    let token = patterns.token.captures(line)?;

    let code = token["code"].split_whitespace().collect::<String>();
    let label = token["label"].split_whitespace().join(" ");
    let name = format!("{} {}", code, label);

    let (date, times) = match (patterns.date.find(line), patterns.time.captures(line)) {
        (Some(date), Some(times)) => (date, times),
        _ => {
            debug!("Skipping line for {} without date or time: {:?}", name, line);
            return None;
        }
    };

    let date = parse_date(date.as_str()).ok()?;
    let start = parse_time(&times[1]).ok()?;
    let end = parse_time(&times[2]).ok()?;

    let location = patterns
        .venue
        .captures(line)
        .map(|c| c[1].trim().to_string())
        .filter(|l| !l.is_empty());

    Some(Session {
        name,
        date,
        start,
        end,
        location,
    })
}

/// Find the sessions in the lines of a document and fold them into weekly
/// entries.
pub fn extract_entries(lines: &[String]) -> Result<Vec<ScheduleEntry>, Error> {
    let patterns = Patterns::new()?;

    let mut sessions: Vec<Session> = lines
        .iter()
        .filter_map(|line| parse_session(line, &patterns))
        .collect();

    ensure!(
        !sessions.is_empty(),
        "No CourseCode+Class sessions found in document"
    );

    sessions.sort_by_cached_key(|s| {
        (s.key(), s.date.weekday().num_days_from_monday(), s.start, s.end, s.date)
    });

    let mut entries = Vec::new();
    for (_, group) in &sessions
        .iter()
        .chunk_by(|s| (s.key(), s.date.weekday(), s.start, s.end))
    {
        let group: Vec<&Session> = group.collect();
        let entry = entry_from_sessions(&group);
        entry.validate()?;
        entries.push(entry);
    }

    info!(
        "Found {} sessions in document, grouped into {} entries",
        sessions.len(),
        entries.len()
    );

    Ok(entries)
}

fn entry_from_sessions(sessions: &[&Session]) -> ScheduleEntry {
    let first = sessions[0];
    let dates: BTreeSet<NaiveDate> = sessions.iter().map(|s| s.date).collect();
    let location = sessions.iter().find_map(|s| s.location.clone());

    let (start_date, end_date) = match (dates.iter().next(), dates.iter().next_back()) {
        (Some(start), Some(end)) => (*start, *end),
        _ => (first.date, first.date),
    };

    if dates.len() == 1 {
        return ScheduleEntry::single(first.name.clone(), start_date, first.start, first.end, location);
    }

    let mut exceptions = BTreeSet::new();
    let mut date = start_date;
    while date <= end_date {
        if !dates.contains(&date) {
            exceptions.insert(date);
        }
        date += Duration::weeks(1);
    }

    ScheduleEntry {
        name: first.name.clone(),
        weekday: start_date.weekday(),
        start: first.start,
        end: first.end,
        location,
        start_date,
        end_date: Some(end_date),
        count: None,
        interval: 1,
        exceptions,
        rdates: BTreeSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn lines(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_document_lines_paragraphs_and_tables() -> Result<(), Error> {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:pPr><w:tabs><w:tab w:val="left" w:pos="720"/></w:tabs></w:pPr><w:r><w:t>Teaching</w:t></w:r><w:r><w:t xml:space="preserve"> Plan &amp; Schedule</w:t></w:r></w:p>
    <w:p><w:r><w:t>COMP2119 Class A</w:t><w:tab/><w:t>2024-09-03</w:t></w:r></w:p>
    <w:p/>
    <w:tbl>
      <w:tr>
        <w:tc><w:p><w:r><w:t>Week 1</w:t></w:r></w:p></w:tc>
        <w:tc><w:p><w:r><w:t>09:30</w:t></w:r></w:p><w:p><w:r><w:t>-11:20</w:t></w:r></w:p></w:tc>
      </w:tr>
    </w:tbl>
  </w:body>
</w:document>"#;

        assert_eq!(
            document_lines(xml)?,
            vec![
                "Teaching Plan & Schedule".to_string(),
                "COMP2119 Class A\t2024-09-03".to_string(),
                "Week 1\t09:30 -11:20".to_string(),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_parse_session() -> Result<(), Error> {
        let patterns = Patterns::new()?;

        let session = parse_session(
            "Week 3\tCOMP 2119 (class 1a)\t17/09/2024\t09:30 – 11:20\tVenue: CYP-107",
            &patterns,
        )
        .unwrap();

        assert_eq!(
            session,
            Session {
                name: "COMP2119 class 1a".to_string(),
                date: date(2024, 9, 17),
                start: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                end: NaiveTime::from_hms_opt(11, 20, 0).unwrap(),
                location: Some("CYP-107".to_string()),
            }
        );

        assert!(parse_session("Office hours 2024-09-17 14:00-15:00", &patterns).is_none());
        assert!(parse_session("COMP2119 Class A introduction", &patterns).is_none());

        Ok(())
    }

    #[test]
    fn test_sessions_fold_into_weekly_entries() -> Result<(), Error> {
        let entries = extract_entries(&lines(&[
            "COMP2119 Class A\t2024-09-03\t09:30-11:20\tVenue: CYP-107",
            "COMP2119 Class A\t2024-09-05\t14:30-15:20\tRoom: MWT2",
            "COMP2119 Class A\t2024-09-10\t09:30-11:20",
            "Reading week, no class",
            "COMP2119 Class A\t2024-09-24\t09:30-11:20",
            "COMP2119 Class A\t2024-09-12\t14:30-15:20",
            "ECON1210 Section 2\t2024-12-12\t10:00-12:00\tVenue: Hall",
        ]))?;

        assert_eq!(entries.len(), 3);

        let tuesday = &entries[0];
        assert_eq!(tuesday.name, "COMP2119 Class A");
        assert_eq!(tuesday.weekday, Weekday::Tue);
        assert_eq!(tuesday.start_date, date(2024, 9, 3));
        assert_eq!(tuesday.end_date, Some(date(2024, 9, 24)));
        assert_eq!(tuesday.location.as_deref(), Some("CYP-107"));
        assert_eq!(
            tuesday.exceptions.iter().copied().collect::<Vec<_>>(),
            vec![date(2024, 9, 17)]
        );

        let thursday = &entries[1];
        assert_eq!(thursday.weekday, Weekday::Thu);
        assert_eq!(thursday.location.as_deref(), Some("MWT2"));
        assert!(thursday.exceptions.is_empty());

        let exam = &entries[2];
        assert_eq!(exam.name, "ECON1210 Section 2");
        assert!(exam.is_single());

        Ok(())
    }

    #[test]
    fn test_label_case_does_not_split_a_class() -> Result<(), Error> {
        let entries = extract_entries(&lines(&[
            "COMP2119 Class A\t2024-09-03\t09:30-11:20",
            "COMP2119 CLASS A\t2024-09-10\t09:30-11:20",
            "COMP2119 class a\t2024-09-17\t09:30-11:20",
        ]))?;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "COMP2119 Class A");
        assert_eq!(entries[0].end_date, Some(date(2024, 9, 17)));
        assert!(entries[0].exceptions.is_empty());

        Ok(())
    }

    #[test]
    fn test_no_sessions_is_an_error() {
        assert!(extract_entries(&lines(&["Course outline", "Assessment: 40% exam"])).is_err());
    }
}
