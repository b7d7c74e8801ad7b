use thiserror::Error;

use crate::common::error::HpcError::GenericError;
use crate::tracker::state::JobStatus;

#[derive(Debug, Error)]
pub enum HpcError {
    /// The remote host could not be reached, even after retries.
    #[error("Cannot connect to {host}: {message}")]
    ConnectionError { host: String, message: String },
    /// A required or invalid field in a job description.
    /// Raised before anything is sent to the remote host.
    #[error("Invalid configuration of `{job}`: {message}")]
    ConfigurationError { job: String, message: String },
    #[error("Unknown job type `{0}`")]
    UnknownTypeError(String),
    /// The scheduler rejected the batch script.
    #[error("Job submission failed: {message}\nScheduler stderr: {stderr}")]
    SubmissionError { message: String, stderr: String },
    #[error("Cancellation of scheduler job {remote_id} failed: {stderr}")]
    CancellationError { remote_id: String, stderr: String },
    #[error("Job {job_id} of stage `{stage}` got no node assignment after {attempts} poll attempts")]
    PollTimeoutError {
        stage: String,
        job_id: String,
        attempts: u32,
    },
    #[error("Job {job_id} of stage `{stage}` ended in state {status} before a node was assigned")]
    JobTerminated {
        stage: String,
        job_id: String,
        status: JobStatus,
    },
    #[error("Cannot parse scheduler output: {0}")]
    ParseError(String),
    #[error("Job {0} is not tracked")]
    UnknownJob(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl HpcError {
    pub fn configuration(job: &str, message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            job: job.to_string(),
            message: message.into(),
        }
    }

    /// Errors that are detected locally, before any remote call is made.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            HpcError::ConfigurationError { .. } | HpcError::UnknownTypeError(_)
        )
    }

    /// Transient failures of the connection to the remote host.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HpcError::ConnectionError { .. })
    }
}

impl From<anyhow::Error> for HpcError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<toml::de::Error> for HpcError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<serde_json::Error> for HpcError {
    fn from(error: serde_json::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<String> for HpcError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
