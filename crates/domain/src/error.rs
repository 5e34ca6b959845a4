/// Shared error type used across all Helm crates.
///
/// The taxonomy is deliberately small: every failure the runtime can
/// surface falls into one of these kinds, and callers match on the kind
/// to decide whether a failure is fatal (store), retriable (transport),
/// or turns into an error transcript entry (everything adapter-side).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The response received from a provider was not an HTTP response.
    #[error("invalid response")]
    InvalidResponse,

    /// A provider returned a non-2xx status. `body` holds at most the
    /// first 64 KiB of the response body.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Malformed wire data: SSE JSON, JWT segments, or a tool-argument
    /// schema mismatch.
    #[error("decoding: {0}")]
    Decoding(String),

    /// Provider mismatch, missing tool, unsupported schema type, or an
    /// exceeded turn cap.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Underlying I/O failure (connect, timeout, broken stream).
    #[error("transport: {0}")]
    Transport(String),

    /// The durable store rejected or failed a write. Fatal to the
    /// in-progress serialized block; the agent re-reads state afterwards.
    #[error("store: {0}")]
    Store(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
