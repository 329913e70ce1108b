use thiserror::Error;

/// Errors raised while validating a parameter set or decoding captured data.
///
/// Local, per-pixel conditions (low modulation, ambiguous unwrap) are never
/// errors; they are flagged in the decoded output instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The parameter combination is invalid or contradictory.
    ///
    /// Raised at validation time, before any encode or decode runs.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// Captured data is incompatible with the active parameter set.
    #[error("frame stack has {actual} {what}, expected {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The multiplex configuration cannot be separated on decode.
    ///
    /// Raised at configuration time, never at decode time.
    #[error("multiplex configuration is not separable: {reason}")]
    Separability { reason: String },
}

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    pub(crate) fn separability(reason: impl Into<String>) -> Self {
        Error::Separability {
            reason: reason.into(),
        }
    }
}
