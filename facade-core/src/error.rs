//! Error types for the facade core

use thiserror::Error;

/// Result type for facade operations
pub type Result<T> = std::result::Result<T, Error>;

/// How an error should be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input: never retried, reported to the caller as a client error
    Input,
    /// Collaborator failed transiently; already retried by the layer that raised it
    Transient,
    /// Collaborator answered but refused (non-200, missing threshold, write failure)
    Logical,
    /// Invariant violation or crashed worker
    Internal,
}

/// Facade errors
#[derive(Error, Debug)]
pub enum Error {
    /// Source type the orchestrator cannot normalize
    #[error("unsupported input source: {0}")]
    UnsupportedSource(String),

    /// A reading failed to decode; the whole batch is rejected
    #[error("malformed reading at position {index}: {reason}")]
    MalformedReading {
        /// Position of the offending item in the batch
        index: usize,
        /// Decoder message
        reason: String,
    },

    /// Batch carried no readings
    #[error("batch contains no readings")]
    EmptyBatch,

    /// Scorer could not be reached within the retry budget
    #[error("error making POST request to model service: {0}")]
    ScorerTransport(String),

    /// Scorer answered with a non-success status
    #[error("model service returned status {status}: {body}")]
    ScorerStatus {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Scorer response body did not decode
    #[error("error decoding response body from model service: {0}")]
    ScorerDecode(String),

    /// Scorer is not healthy at startup
    #[error("ml service is not healthy after {attempts} attempts")]
    ScorerUnhealthy {
        /// Health checks performed
        attempts: u32,
    },

    /// Scorer returned a different number of errors than readings sent
    #[error("scorer returned {actual} reconstruction errors for {expected} readings")]
    LengthMismatch {
        /// Readings in the batch
        expected: usize,
        /// Reconstruction errors returned
        actual: usize,
    },

    /// No threshold stored for the machine
    #[error("no threshold set for machine {0}")]
    ThresholdNotFound(i64),

    /// Key-value store failure
    #[error("store error: {0}")]
    Store(String),

    /// Counter outside its clamp observed in the store
    #[error("counter for machine {machine_id} out of range: {value}")]
    CounterOutOfRange {
        /// Machine id
        machine_id: i64,
        /// Value read back from the store
        value: i64,
    },

    /// Record sink failure
    #[error("record sink error: {0}")]
    Sink(String),

    /// Broker connection, channel or queue failure
    #[error("broker error: {0}")]
    Broker(String),

    /// Broker closed the connection while consuming
    #[error("broker connection closed: {0}")]
    ConnectionClosed(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A unit of work panicked
    #[error("worker panicked: {0}")]
    Panicked(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Classify the error for retry and response mapping
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::UnsupportedSource(_)
            | Error::MalformedReading { .. }
            | Error::EmptyBatch
            | Error::LengthMismatch { .. }
            | Error::Serialization(_) => ErrorClass::Input,
            Error::ScorerTransport(_)
            | Error::ScorerUnhealthy { .. }
            | Error::Broker(_)
            | Error::ConnectionClosed(_) => ErrorClass::Transient,
            Error::ScorerStatus { .. }
            | Error::ScorerDecode(_)
            | Error::ThresholdNotFound(_)
            | Error::Store(_)
            | Error::Sink(_) => ErrorClass::Logical,
            Error::CounterOutOfRange { .. } | Error::Config(_) | Error::Panicked(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Short machine-readable code, used in logs and JSON envelopes
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnsupportedSource(_) => "UNSUPPORTED_SOURCE",
            Error::MalformedReading { .. } | Error::Serialization(_) => "MALFORMED_INPUT",
            Error::EmptyBatch => "EMPTY_BATCH",
            Error::ScorerTransport(_) => "SCORER_UNREACHABLE",
            Error::ScorerStatus { .. } => "SCORER_STATUS",
            Error::ScorerDecode(_) => "SCORER_DECODE",
            Error::ScorerUnhealthy { .. } => "SCORER_UNHEALTHY",
            Error::LengthMismatch { .. } => "LENGTH_MISMATCH",
            Error::ThresholdNotFound(_) => "THRESHOLD_NOT_FOUND",
            Error::Store(_) => "STORE_ERROR",
            Error::CounterOutOfRange { .. } => "COUNTER_OUT_OF_RANGE",
            Error::Sink(_) => "SINK_ERROR",
            Error::Broker(_) => "BROKER_ERROR",
            Error::ConnectionClosed(_) => "BROKER_CLOSED",
            Error::Config(_) => "CONFIGURATION_ERROR",
            Error::Panicked(_) => "INTERNAL_ERROR",
        }
    }
}

impl Error {
    /// Convert a caught panic payload into [`Error::Panicked`]
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Error::Panicked(message)
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_are_not_transient() {
        assert_eq!(Error::EmptyBatch.class(), ErrorClass::Input);
        assert_eq!(
            Error::LengthMismatch { expected: 3, actual: 2 }.class(),
            ErrorClass::Input
        );
        assert_eq!(
            Error::UnsupportedSource("text/plain".into()).class(),
            ErrorClass::Input
        );
    }

    #[test]
    fn test_collaborator_errors() {
        assert_eq!(
            Error::ScorerTransport("refused".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(Error::ThresholdNotFound(7).class(), ErrorClass::Logical);
        assert_eq!(
            Error::ScorerStatus { status: 500, body: String::new() }.class(),
            ErrorClass::Logical
        );
    }

    #[test]
    fn test_connection_closed_is_transient() {
        let err = Error::ConnectionClosed("connection lost".to_string());
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(err.code(), "BROKER_CLOSED");
        assert_eq!(err.to_string(), "broker connection closed: connection lost");
    }

    #[test]
    fn test_length_mismatch_message() {
        let err = Error::LengthMismatch { expected: 3, actual: 2 };
        assert_eq!(
            err.to_string(),
            "scorer returned 2 reconstruction errors for 3 readings"
        );
        assert_eq!(err.code(), "LENGTH_MISMATCH");
    }

    #[test]
    fn test_from_panic_payload() {
        let err = Error::from_panic(Box::new("boom"));
        assert!(matches!(err, Error::Panicked(ref m) if m == "boom"));

        let err = Error::from_panic(Box::new(String::from("bang")));
        assert_eq!(err.to_string(), "worker panicked: bang");
    }
}
