/// Error returned from the calibration engines.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FgcmError {
    /// Options that cannot be combined.
    #[error("incompatible options: {0}")]
    IncompatibleOptions(&'static str),

    /// No object passes the selection.
    #[error("no good stars to fit")]
    NoGoodStars,

    /// Fewer constraints than active parameters.
    #[error("number of fitted parameters {n_pars} is not smaller than the number of constraints {n_obs}")]
    NonPositiveDof {
        /// Number of observations.
        n_obs: usize,
        /// Number of active parameters.
        n_pars: usize,
    },

    /// A residual statistic was requested before the chi-squared pass.
    #[error("standardized magnitudes must be computed before {0}")]
    MagStdNotComputed(&'static str),

    /// An input array has the wrong length.
    #[error("{name} has length {actual}, expected {expected}")]
    ShapeMismatch {
        /// Name of the array.
        name: &'static str,
        /// Required length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// The observation table is not sorted by object.
    #[error("observations must be sorted by object index")]
    UnsortedObservations,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A statistic cannot be computed from the sample.
    #[error("degenerate sample: {0}")]
    DegenerateSample(&'static str),
}

impl FgcmError {
    pub(crate) fn check_len(name: &'static str, expected: usize, actual: usize) -> Result<(), Self> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::ShapeMismatch {
                name,
                expected,
                actual,
            })
        }
    }
}
