use thiserror::Error;

#[derive(Error, Debug)]
pub enum StyraError {
    #[error("Remote API call '{operation}' failed: {details}")]
    Api { operation: String, details: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Resource already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Machine operation '{operation}' failed: {details}")]
    MachineOperationFailed { operation: String, details: String },

    #[error("Stage '{stage}' failed")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<StyraError>,
    },

    #[error("Rollback after failure left remote state behind: {original} (cleanup errors: {})", format_errors(.cleanup))]
    RollbackFailed {
        original: Box<StyraError>,
        cleanup: Vec<StyraError>,
    },

    #[error("Operation '{operation}' timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("{operation} finished with {} error(s): {}", .errors.len(), format_errors(.errors))]
    Aggregate {
        operation: String,
        errors: Vec<StyraError>,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn format_errors(errors: &[StyraError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl StyraError {
    /// True for errors that only mean "the entity is not there yet/anymore".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StyraError::NotFound { .. })
    }

    /// Wrap an error as the failure of a named orchestration stage.
    pub fn stage(stage: impl Into<String>, source: StyraError) -> Self {
        StyraError::StageFailed {
            stage: stage.into(),
            source: Box::new(source),
        }
    }
}

pub type StyraResult<T> = Result<T, StyraError>;
