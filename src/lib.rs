//! Convert class schedules, given as CSV rows or DOCX teaching plans, into
//! iCalendar files with recurring events.

pub mod components;
pub mod config;
pub mod csv_input;
pub mod docx_input;
pub mod escape;
pub mod parser;
pub mod property;
pub mod schedule;

use std::{fs, path::Path};

use anyhow::{Context, Error};
use tracing::info;

use crate::{
    components::VCalendar,
    config::{InputFormat, Options},
    schedule::ScheduleEntry,
};

/// Read the schedule entries from a file of the given format.
pub fn read_schedule(
    path: &Path,
    format: InputFormat,
    options: &Options,
) -> Result<Vec<ScheduleEntry>, Error> {
    match format {
        InputFormat::Csv => csv_input::read_entries_from_path(path, options),
        InputFormat::Docx => docx_input::read_entries_from_path(path),
    }
}

/// Convert a schedule file to a calendar written at `outfile`, returning the
/// number of events written.
pub fn convert(
    input: &Path,
    format: InputFormat,
    outfile: &Path,
    options: &Options,
) -> Result<usize, Error> {
    let entries = read_schedule(input, format, options)?;
    let calendar = VCalendar::from_entries(&entries, options)?;

    fs::write(outfile, calendar.to_ics())
        .with_context(|| format!("writing {}", outfile.display()))?;

    info!(
        "Converted {} ({}) into {} events",
        input.display(),
        format,
        calendar.events.len()
    );

    Ok(calendar.events.len())
}

/// Parse every calendar in an `.ics` file.
pub fn read_calendars(path: &Path) -> Result<Vec<VCalendar>, Error> {
    let data =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    parser::Component::from_str_to_stream(&data)?
        .into_iter()
        .map(VCalendar::try_from)
        .collect()
}
