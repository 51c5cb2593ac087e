use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    /// A config source could not be read or did not match the schema.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CadenceError {
    /// Short error code string returned to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            CadenceError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
