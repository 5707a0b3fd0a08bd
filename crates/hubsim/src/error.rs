use std::borrow::Cow;

/// All possible error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or contradictory configuration.
    ///
    /// Always raised before any connection attempt.
    Input,
    /// The device connection cannot be opened or closed.
    Connection,
    /// A single send, settlement, upload or registry operation failed.
    Service,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::Input => "Input",
            Self::Connection => "Connection",
            Self::Service => "Service",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// A simulator error.
#[derive(PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    info: Cow<'static, str>,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error(f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error(f)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Creates an [`Error`] of the given [`ErrorKind`] with some
    /// information about it.
    pub fn new(kind: ErrorKind, info: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            info: info.into(),
        }
    }

    /// Creates an [`ErrorKind::Input`] error.
    pub fn input(info: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Input, info)
    }

    /// Creates an [`ErrorKind::Connection`] error.
    pub fn connection(info: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Connection, info)
    }

    /// Creates an [`ErrorKind::Service`] error.
    pub fn service(info: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Service, info)
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error information.
    #[must_use]
    pub fn info(&self) -> &str {
        &self.info
    }

    fn error(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {}", self.kind, self.info)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::service(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::service(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::service(format!("Json error caused by {e}"))
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::service(e.to_string())
    }
}

impl From<rumqttc::ConnectionError> for Error {
    fn from(e: rumqttc::ConnectionError) -> Self {
        Self::connection(e.to_string())
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};

    #[test]
    fn display_contains_kind_and_info() {
        let error = Error::input("Nothing to do");
        assert_eq!(error.kind(), ErrorKind::Input);
        assert_eq!(error.info(), "Nothing to do");
        assert_eq!(error.to_string(), "Input error: Nothing to do");
    }

    #[test]
    fn io_errors_are_service_errors() {
        let error: Error = std::io::Error::other("disk on fire").into();
        assert_eq!(error.kind(), ErrorKind::Service);
    }
}
