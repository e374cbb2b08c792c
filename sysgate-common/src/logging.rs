//! logger setup for embedders and tests

use std::io::{Error, ErrorKind, Result};

fn fern_with_output(output: Option<&str>) -> Result<fern::Dispatch> {
    match output {
        None => Ok(fern::Dispatch::new().chain(std::io::stderr())),
        Some(s) => match s {
            "stdout" => Ok(fern::Dispatch::new().chain(std::io::stdout())),
            "stderr" => Ok(fern::Dispatch::new().chain(std::io::stderr())),
            output => {
                let f = std::fs::OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .create(true)
                    .open(output)?;
                Ok(fern::Dispatch::new().chain(f))
            }
        },
    }
}

/// numeric debug level [0..5] to a fern dispatcher: 0 is off, 5 is
/// trace.
pub fn setup_logger(level: u32, output: Option<&str>) -> Result<()> {
    let log_level = match level {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    fern_with_output(output)?
        .level(log_level)
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .apply()
        .map_err(|e| Error::new(ErrorKind::Other, e))
}
