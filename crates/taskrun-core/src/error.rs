use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskrunError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskrunError {
    /// Short error code string used in logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            TaskrunError::Config(_) => "CONFIG_ERROR",
            TaskrunError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskrunError>;
