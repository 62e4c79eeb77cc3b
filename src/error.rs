//! Error types for robot control operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RobotError>;

#[derive(Error, Debug)]
pub enum RobotError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Operation timed out: {0}")]
    TimedOut(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
