use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanflowError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Another executor owns the instance: its lease moved on or the event
    /// slot was already taken.
    #[error("Fenced: {0}")]
    Fenced(String),

    #[error(
        "Non-deterministic replay of workflow {workflow_id} at seq {seq}: expected {expected}, found {found}"
    )]
    NonDeterministic {
        workflow_id: String,
        seq: u64,
        expected: String,
        found: String,
    },

    #[error("Unsupported payload version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Step {step} failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Workflow {workflow_id} failed: {error}")]
    WorkflowFailed { workflow_id: String, error: String },

    #[error("Scanner error: {0}")]
    Scanner(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanflowError {
    /// Failures that indicate a store/transport hiccup rather than bad data.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "postgres")]
            ScanflowError::Database(_) => true,
            ScanflowError::Internal(msg) | ScanflowError::Scanner(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("timeout")
                    || lower.contains("timed out")
                    || lower.contains("connection")
                    || lower.contains("unavailable")
                    || lower.contains("503")
            }
            _ => false,
        }
    }

    /// The value itself could not be decoded; retrying will not help.
    pub fn is_payload_error(&self) -> bool {
        matches!(
            self,
            ScanflowError::Serialization(_) | ScanflowError::UnsupportedVersion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanflowError>;
