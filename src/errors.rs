//! Error types for the state notifier

use std::fmt;

pub type Result<T> = std::result::Result<T, NotifierError>;

#[derive(Debug)]
pub enum NotifierError {
    /// IO operation failed
    Io(std::io::Error),

    /// HTTP request failed
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// Fetching external state for a watch-group failed
    Fetch { key: String, message: String },

    /// No subject or watch-group registered under this id
    NotFound(String),

    /// A subject or watch-group with this id is already registered
    AlreadyExists(String),

    /// Persistence store failure
    Store(String),

    /// Notification delivery failure
    Notify(String),
}

impl NotifierError {
    pub fn fetch(key: impl Into<String>, message: impl Into<String>) -> Self {
        NotifierError::Fetch {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for NotifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifierError::Io(err) => write!(f, "IO error: {}", err),
            NotifierError::Http(err) => write!(f, "HTTP error: {}", err),
            NotifierError::Json(err) => write!(f, "JSON error: {}", err),
            NotifierError::Config(msg) => write!(f, "Configuration error: {}", msg),
            NotifierError::Fetch { key, message } => {
                write!(f, "Fetch error for {}: {}", key, message)
            }
            NotifierError::NotFound(id) => write!(f, "Not found: {}", id),
            NotifierError::AlreadyExists(id) => write!(f, "Already exists: {}", id),
            NotifierError::Store(msg) => write!(f, "Store error: {}", msg),
            NotifierError::Notify(msg) => write!(f, "Notification error: {}", msg),
        }
    }
}

impl std::error::Error for NotifierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifierError::Io(err) => Some(err),
            NotifierError::Http(err) => Some(err),
            NotifierError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NotifierError {
    fn from(err: std::io::Error) -> Self {
        NotifierError::Io(err)
    }
}

impl From<reqwest::Error> for NotifierError {
    fn from(err: reqwest::Error) -> Self {
        NotifierError::Http(err)
    }
}

impl From<serde_json::Error> for NotifierError {
    fn from(err: serde_json::Error) -> Self {
        NotifierError::Json(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = NotifierError::fetch("alpha", "status 503");
        assert_eq!(err.to_string(), "Fetch error for alpha: status 503");

        let err = NotifierError::NotFound("viper".to_string());
        assert_eq!(err.to_string(), "Not found: viper");

        let err = NotifierError::AlreadyExists("viper".to_string());
        assert_eq!(err.to_string(), "Already exists: viper");
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: NotifierError = io.into();
        assert!(err.source().is_some());
        assert!(NotifierError::Store("x".to_string()).source().is_none());
    }
}
