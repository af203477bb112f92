//! Error types shared across duet crates

use thiserror::Error;

/// Failures reported by the secure peer transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("data channel is not open")]
    ChannelNotOpen,

    #[error("transport backend error: {0}")]
    Backend(String),
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("no configuration directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::ChannelNotOpen.to_string(), "data channel is not open");
        assert_eq!(
            TransportError::Negotiation("no remote description".into()).to_string(),
            "negotiation failed: no remote description"
        );
        assert_eq!(
            ConfigError::Parse("bad key".into()).to_string(),
            "parse error: bad key"
        );
    }
}
