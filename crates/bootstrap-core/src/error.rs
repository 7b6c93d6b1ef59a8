use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("missing required variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),

    #[error("timed out after {}s waiting for {description}", .elapsed.as_secs())]
    TimedOut {
        description: String,
        elapsed: Duration,
    },

    #[error("{description} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        description: String,
        attempts: u32,
        last_error: String,
    },

    #[error("process error: {0}")]
    Process(String),

    #[error("{program} failed: {message}")]
    External { program: String, message: String },

    #[error("tool not found on PATH: {0}")]
    ToolNotFound(String),

    #[error("invalid memory quantity '{0}': expected a number with a k/m/g/t or Ki/Mi/Gi/Ti suffix")]
    InvalidQuantity(String),

    #[error("invalid cpu value {0}: must be a positive number")]
    InvalidCpu(f64),

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("invalid name '{0}': use lowercase letters, digits and inner hyphens")]
    InvalidName(String),

    #[error("config file not found: {0}")]
    ConfigNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BootstrapError {
    pub fn external(program: impl Into<String>, message: impl Into<String>) -> Self {
        BootstrapError::External {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Validation failures abort a run before any mutation, regardless of the
    /// stage's own failure policy.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BootstrapError::MissingVariables(_)
                | BootstrapError::Validation(_)
                | BootstrapError::ConfigNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;
