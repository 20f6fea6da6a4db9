use std::{fmt, path::Path, str::FromStr};

use anyhow::{bail, format_err, Error};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

pub const DEFAULT_PRODID: &str = "-//schedule-ics//Course Importer//EN";

/// Occurrences given to a recurring entry with neither a count nor an end
/// date.
pub const FALLBACK_COUNT: u32 = 30;

/// Settings that apply to every entry of a conversion.
#[derive(Debug, Clone)]
pub struct Options {
    /// Zone the times in the input are expressed in.
    pub timezone: Tz,
    pub prodid: String,
    /// Display name of the calendar (`X-WR-CALNAME`).
    pub calendar_name: Option<String>,
    /// Start date for recurring rows that don't give one.
    pub term_start: Option<NaiveDate>,
    /// Count for recurring rows that give neither a count nor an end date.
    pub weeks: Option<u32>,
    pub dtstamp: DateTime<Utc>,
}

impl Options {
    /// The count applied to entries that don't say when they end.
    pub fn fallback_count(&self) -> u32 {
        self.weeks.unwrap_or(FALLBACK_COUNT)
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            timezone: chrono_tz::Asia::Hong_Kong,
            prodid: DEFAULT_PRODID.to_string(),
            calendar_name: None,
            term_start: None,
            weeks: None,
            dtstamp: Utc::now(),
        }
    }
}

/// The kinds of schedule file that can be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    Docx,
}

impl InputFormat {
    /// Guess the format from the file extension.
    pub fn from_path(path: &Path) -> Result<InputFormat, Error> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| format_err!("Cannot tell the format of {}", path.display()))?;

        extension
            .parse()
            .map_err(|_| format_err!("Unsupported input extension: .{}", extension))
    }
}

impl FromStr for InputFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match &value.to_ascii_lowercase() as &str {
            "csv" => InputFormat::Csv,
            "docx" => InputFormat::Docx,
            _ => bail!("Unknown input format: '{}'", value),
        })
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputFormat::Csv => "csv",
            InputFormat::Docx => "docx",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_format_from_path() {
        assert_eq!(InputFormat::from_path(Path::new("plan.DOCX")).unwrap(), InputFormat::Docx);
        assert_eq!(InputFormat::from_path(Path::new("dir/week.csv")).unwrap(), InputFormat::Csv);
        assert!(InputFormat::from_path(Path::new("schedule.xlsx")).is_err());
        assert!(InputFormat::from_path(Path::new("schedule")).is_err());
    }

    #[test]
    fn test_fallback_count() {
        let options = Options::default();
        assert_eq!(options.fallback_count(), 30);

        let options = Options {
            weeks: Some(13),
            ..options
        };
        assert_eq!(options.fallback_count(), 13);
    }
}
