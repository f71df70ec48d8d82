/// All recoverable failures of the engine and its session layer.
///
/// Operator shape violations are not represented here: they indicate a
/// corrupted graph construction and abort through `assert!`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A network needs at least one hidden layer.
    #[error("cannot create a network without hidden layers")]
    EmptyHiddenLayers,

    /// A hidden layer of width zero.
    #[error("hidden layer {depth} has size 0")]
    ZeroSizedLayer { depth: usize },

    /// Training text contained no usable sentence.
    #[error("training corpus is empty")]
    EmptyCorpus,

    /// The model does not hold a parameter the architecture needs.
    #[error("model is missing parameter `{name}`")]
    MissingParameter { name: String },

    /// A loaded parameter does not fit the architecture it claims.
    #[error("parameter `{name}` has shape [{got_rows}x{got_cols}], expected [{rows}x{cols}]")]
    ArchitectureMismatch {
        name: String,
        rows: usize,
        cols: usize,
        got_rows: usize,
        got_cols: usize,
    },

    /// A tensor whose buffer does not match its declared shape.
    #[error("tensor [{rows}x{cols}] needs {expected} values, got {got}")]
    InvalidTensor {
        rows: usize,
        cols: usize,
        expected: usize,
        got: usize,
    },

    /// Letter/index maps that do not describe the same vocabulary.
    #[error("invalid vocabulary: {0}")]
    InvalidVocabulary(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::msg(format!($($arg)*)))
    };
}
