use thiserror::Error;

/// Errors raised while decoding or servicing DHT traffic.
///
/// All of these are local to a single datagram: the engine logs the error,
/// drops the message, and keeps running.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unknown query method: {0}")]
    UnknownMethod(String),

    #[error("reply does not match any query we sent")]
    UnmatchedReply,

    #[error("unknown remote fault code: {0}")]
    UnknownFaultCode(i64),

    #[error("packed {kind} records truncated at {len} bytes")]
    TruncatedRecords { kind: &'static str, len: usize },
}
