pub mod json;
pub mod literal;
pub mod text;

use std::fs::OpenOptions;
use std::io::{self, BufWriter, IsTerminal, Write};

use thiserror::Error;

use crate::config::{OutputConfig, OutputFormat};
use crate::tracer::event::EventRecord;

use self::json::JsonSink;
use self::text::TextSink;

/// Path value selecting standard output.
pub const STDOUT_PATH: &str = "-";

/// Failure delivering a record.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("writing event output")]
    Io(#[from] io::Error),

    #[error("encoding event as JSON")]
    Encode(#[from] serde_json::Error),

    /// Writing captured terminal traffic back to a terminal would be captured
    /// again by the probes.
    #[error("refusing to write events to terminal {path}")]
    TerminalOutput { path: String },
}

/// Consumes enriched events in arrival order.
///
/// `handle_event` returns only once the record is accepted; the assembler
/// never pulls the next record before that.
pub trait EventSink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Deliver one record.
    fn handle_event(&mut self, event: &EventRecord) -> Result<(), SinkError>;

    /// Flush anything buffered.
    fn flush(&mut self) -> Result<(), SinkError>;
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn handle_event(&mut self, event: &EventRecord) -> Result<(), SinkError> {
        (**self).handle_event(event)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Open the configured output. Terminals are refused.
pub fn open(cfg: &OutputConfig) -> Result<Box<dyn EventSink>, SinkError> {
    let writer: Box<dyn Write + Send> = if cfg.path == STDOUT_PATH {
        let stdout = io::stdout();
        check_target(&cfg.path, stdout.is_terminal())?;
        Box::new(stdout)
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.path)?;
        check_target(&cfg.path, file.is_terminal())?;
        Box::new(file)
    };

    Ok(from_writer(BufWriter::new(writer), cfg))
}

/// Build a sink of the configured format over an arbitrary writer.
pub fn from_writer<W: Write + Send + 'static>(
    writer: W,
    cfg: &OutputConfig,
) -> Box<dyn EventSink> {
    match cfg.format {
        OutputFormat::Text => Box::new(TextSink::new(writer, cfg.flush_each_event)),
        OutputFormat::Json => Box::new(JsonSink::new(writer, cfg.flush_each_event)),
    }
}

fn check_target(path: &str, is_terminal: bool) -> Result<(), SinkError> {
    if is_terminal {
        return Err(SinkError::TerminalOutput {
            path: path.to_string(),
        });
    }
    Ok(())
}
