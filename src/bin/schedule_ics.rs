use std::{path::PathBuf, str::FromStr};

use anyhow::{format_err, Context, Error};
use chrono::NaiveDate;
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use schedule_ics::{
    config::{InputFormat, Options, DEFAULT_PRODID},
    convert, read_calendars,
    schedule::parse_date,
};

#[derive(Parser)]
#[command(
    name = "schedule_ics",
    version,
    about = "Convert CSV or DOCX class schedules into iCalendar files"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging, -v for debug and -vv for trace. RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a schedule into an .ics file
    Convert {
        /// CSV or DOCX file to read
        input: PathBuf,

        /// Input format, guessed from the extension when not given
        #[arg(long, value_parser = InputFormat::from_str)]
        format: Option<InputFormat>,

        /// Where to write the calendar, defaults to the input with an .ics
        /// extension
        #[arg(short, long)]
        outfile: Option<PathBuf>,

        /// IANA timezone the schedule's times are in
        #[arg(long, default_value = "Asia/Hong_Kong")]
        tz: String,

        /// Start date for recurring rows without one
        #[arg(long, value_parser = parse_date)]
        term_start: Option<NaiveDate>,

        /// Occurrences for recurring rows with neither a count nor an end date
        #[arg(long)]
        weeks: Option<u32>,

        /// Display name of the calendar
        #[arg(long)]
        calendar_name: Option<String>,

        #[arg(long, default_value = DEFAULT_PRODID)]
        prodid: String,
    },

    /// Print the events of an .ics file and their first occurrences
    Inspect {
        ics: PathBuf,

        /// Occurrences to print per event
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Convert {
            input,
            format,
            outfile,
            tz,
            term_start,
            weeks,
            calendar_name,
            prodid,
        } => {
            let timezone = Tz::from_str(&tz).map_err(|_| format_err!("Unknown timezone: {}", tz))?;

            let format = match format {
                Some(format) => format,
                None => InputFormat::from_path(&input)?,
            };

            let outfile = outfile.unwrap_or_else(|| input.with_extension("ics"));

            let options = Options {
                timezone,
                prodid,
                calendar_name,
                term_start,
                weeks,
                ..Options::default()
            };

            let events = convert(&input, format, &outfile, &options)
                .with_context(|| format!("converting {}", input.display()))?;

            println!("Wrote {} with {} events", outfile.display(), events);
        }
        Commands::Inspect { ics, limit } => {
            for calendar in read_calendars(&ics)? {
                if let Some(name) = &calendar.name {
                    println!("{}", name);
                }

                for event in &calendar.events {
                    println!(
                        "{} @ {}",
                        event.summary.as_deref().unwrap_or("(no summary)"),
                        event.location.as_deref().unwrap_or("-"),
                    );

                    let duration = event.duration()?;
                    for start in event.recur_iter(&calendar)?.take(limit) {
                        println!(
                            "  {} - {}",
                            start.format("%a %Y-%m-%d %H:%M"),
                            (start + duration).format("%H:%M")
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
