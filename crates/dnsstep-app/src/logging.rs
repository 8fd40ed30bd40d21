use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

use clap::{Arg, ArgMatches, Command};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Destination of formatted log lines.
pub enum LogWriter {
    File(File),
    Stderr,
}

impl LogWriter {
    pub fn open_file(path: &Path) -> Result<Self, std::io::Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        Ok(Self::File(file))
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::File(file) => file.write(buf),
            Self::Stderr => std::io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::File(file) => file.flush(),
            Self::Stderr => std::io::stderr().flush(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Default,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "default" => Ok(Self::Default),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format {}", value)),
        }
    }
}

pub fn logging_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .short('l')
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("warn")
                .default_value_if("verbose", None, Some("debug"))
                .help("Set the level of severity of logging messages."),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .conflicts_with("log_level")
                .help("Print every processing step. Set log level to 'debug'."),
        )
        .arg(
            Arg::new("log_filter")
                .long("log-filter")
                .conflicts_with("log_level")
                .takes_value(true)
                .help("Filter level of severity and targets of logging messages."),
        )
        .arg(
            Arg::new("log_file")
                .long("log-file")
                .takes_value(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Write logging messages to a file."),
        )
        .arg(
            Arg::new("log_format")
                .long("log-format")
                .takes_value(true)
                .value_parser(clap::value_parser!(LogFormat))
                .default_value("default")
                .help("Format of logging messages: 'default' or 'json'."),
        )
}

fn log_filter(arg_matches: &ArgMatches) -> anyhow::Result<EnvFilter> {
    match arg_matches.get_one::<String>("log_filter") {
        Some(filter) => Ok(EnvFilter::try_new(filter)?),
        None => {
            let level = arg_matches
                .get_one::<String>("log_level")
                .map(String::as_str)
                .unwrap_or("warn");
            Ok(EnvFilter::try_new(format!(
                "dnsstep={},dnsstep_app={}",
                level, level
            ))?)
        }
    }
}

pub fn set_up_logging(arg_matches: &ArgMatches) -> anyhow::Result<()> {
    let filter = log_filter(arg_matches)?;

    let (writer, ansi) = match arg_matches.get_one::<PathBuf>("log_file") {
        Some(path) => (LogWriter::open_file(path)?, false),
        None => (LogWriter::Stderr, use_console_color_stderr()),
    };
    let writer = Mutex::new(writer);

    let format = arg_matches
        .get_one::<LogFormat>("log_format")
        .copied()
        .unwrap_or(LogFormat::Default);

    let (subscriber_default, subscriber_json) = match format {
        LogFormat::Default => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .json(),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber_default)
        .with(subscriber_json)
        .init();

    Ok(())
}

pub fn use_console_color_stderr() -> bool {
    console::colors_enabled_stderr() && std::env::var_os("NO_COLOR").is_none()
}
