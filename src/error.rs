use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("malformed record at index {index}: {reason}")]
    MalformedRecord { index: usize, reason: String },
    #[error("unsupported parameter rank {0} for unit-wise norm")]
    UnsupportedShape(usize),
    #[error("no training data in {0:?}")]
    NoTrainingData(Vec<String>),
    #[error("{what} has {len} positions, needs at least {need}")]
    InsufficientData { what: &'static str, len: usize, need: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: String, reason: String },
    #[error(transparent)]
    Tch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, TrainError>;

impl TrainError {
    pub fn io(path : &str, source : std::io::Error) -> Self {
        TrainError::Io { path: path.to_string(), source }
    }

    pub fn malformed(index : usize, reason : impl Into<String>) -> Self {
        TrainError::MalformedRecord { index, reason: reason.into() }
    }
}
