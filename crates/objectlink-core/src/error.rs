// Error types for objectlink-core

use thiserror::Error;

/// Result type alias for objectlink-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using objectlink-core
#[derive(Debug, Error)]
pub enum Error {
    /// Frame could not be parsed into a protocol message
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// A frame addressed an object that is not registered
    #[error("No registered object named '{0}'")]
    UnknownObject(String),

    /// INVOKE_REPLY arrived for a request id that is not pending
    #[error("No pending invoke for request {0}")]
    InvokeMismatch(u64),

    /// A source's invoke handler signalled failure
    #[error("Invocation failed: {0}")]
    Invocation(String),

    /// The invoke was still outstanding when the engine shut down
    #[error("Invoke cancelled: protocol shut down")]
    Cancelled,

    /// Write attempted after the engine shut down
    #[error("Protocol is shut down")]
    Closed,

    /// Value could not be encoded in the selected wire format
    #[error("Encode error: {0}")]
    Encode(String),

    /// Bytes could not be decoded in the selected wire format
    #[error("Decode error: {0}")]
    Decode(String),
}
