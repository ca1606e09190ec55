use thiserror::Error;

/// Everything that can fail a single job. The process keeps serving after any of these.
#[derive(Debug, Error)]
pub enum JobError {
    /// A required field is missing or a field failed coercion/range checks.
    #[error("{0}")]
    Validation(String),
    /// The reference image is not valid base64 or not a readable image.
    #[error("{0}")]
    Decode(String),
    /// Loading the pipeline or running it failed.
    #[error("{0:#}")]
    Model(anyhow::Error),
}

impl JobError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Model(_) => ErrorKind::Model,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Decode,
    Model,
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Model(err)
    }
}

pub type JobResult<T> = std::result::Result<T, JobError>;
