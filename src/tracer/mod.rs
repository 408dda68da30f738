pub mod event;
pub mod parse;
pub mod source;
pub mod stats;

#[cfg(feature = "bpf")]
pub mod bpf;

use thiserror::Error;

use self::event::RawEventRecord;
use self::parse::ParseError;

/// Unrecoverable failure reading raw records.
///
/// The assembler stops on any of these; resuming requires re-establishing the
/// capture mechanism, which is the caller's decision.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("reading event source")]
    Io(#[from] std::io::Error),

    #[error("malformed raw record")]
    Malformed(#[from] ParseError),

    #[error("event producer terminated")]
    ProducerTerminated,
}

impl SourceError {
    /// Short label for metrics and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Malformed(_) => "malformed",
            Self::ProducerTerminated => "producer_terminated",
        }
    }
}

/// Narrow read interface over the raw capture buffer.
///
/// Implementations are fed by uncoordinated producers and read by exactly one
/// consumer. Ordering holds only per producer; arrival order is all a reader sees.
pub trait EventSource: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Wait for the next record. There is no timeout: this resolves only when a
    /// record arrives or the source fails.
    ///
    /// Must be cancel safe: dropping the future before it resolves loses no
    /// record.
    fn recv(
        &mut self,
    ) -> impl std::future::Future<Output = Result<RawEventRecord, SourceError>> + Send;

    /// Records dropped at the boundary because the buffer was full, if the
    /// source keeps such a counter.
    fn dropped(&self) -> Option<u64>;
}
