use std::fmt;
use thiserror::Error;

/// Result alias for core operations.
pub type CardgateResult<T> = Result<T, CardgateError>;

/// Result alias for calls into a card driver.
pub type DriverResult<T> = Result<T, DriverError>;

/// Fault reported by the reader/card driver.
///
/// `code` carries the driver's native error number (PC/SC style), `message`
/// the human-readable text the driver associates with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub code: u32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}: {}", self.code, self.message)
    }
}

impl std::error::Error for DriverError {}

#[derive(Error, Debug)]
pub enum CardgateError {
    #[error("[CG1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[CG1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[CG1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[CG1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[CG2000] smartcard error {0}")]
    Driver(#[from] DriverError),

    #[error("[CG2100] unexpected card response: {0}")]
    Protocol(String),

    #[error("[CG2200] credential plugin error: {0}")]
    Plugin(String),
}

impl CardgateError {
    pub fn code(&self) -> &'static str {
        match self {
            CardgateError::Io(_) => "CG1000",
            CardgateError::Toml(_) => "CG1001",
            CardgateError::Yaml(_) => "CG1002",
            CardgateError::InvalidConfig(_) => "CG1100",
            CardgateError::Driver(_) => "CG2000",
            CardgateError::Protocol(_) => "CG2100",
            CardgateError::Plugin(_) => "CG2200",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_displays_hex_code() {
        let err = CardgateError::from(DriverError::new(0x8010_0069, "card removed"));
        assert_eq!(err.code(), "CG2000");
        assert_eq!(err.to_string(), "[CG2000] smartcard error 80100069: card removed");
    }
}
