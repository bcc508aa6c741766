use thiserror::Error;

/// Failures raised by the data, design and checkpoint layers.
///
/// Every variant is fatal: nothing in the pipeline retries, the error is
/// propagated to the caller and reported with the offending names.
#[derive(Debug, Error)]
pub enum HsslError {
    #[error("no parser for file {path} (supported file extension patterns: {})", supported.join(", "))]
    UnsupportedFormat {
        path: String,
        supported: Vec<&'static str>,
    },

    #[error("dict keys are inconsistent: expected [{}], got [{}]", expected.join(", "), found.join(", "))]
    InconsistentKeys {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("the following covariates are missing from the design: {}", .0.join(", "))]
    MissingCovariate(Vec<String>),

    #[error("checkpoint holds {stored} optimizer states but {provided} optimizers were given")]
    StateMismatch { stored: usize, provided: usize },

    #[error("{what}: expected {expected:?}, got {found:?}")]
    DimensionMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("failed to parse {path} line {line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image error on {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("checkpoint record error on {path}: {message}")]
    Recorder { path: String, message: String },

    #[error("failed to install interrupt hook: {0}")]
    Signal(String),
}

impl HsslError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, HsslError>;
