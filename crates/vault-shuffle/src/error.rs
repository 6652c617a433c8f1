use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad mapping, unknown region, malformed account. Aborts before side effects.
    Config,
    /// Throttling, network trouble, call timeouts. Retried with backoff.
    Transient,
    /// Auth failures, missing resources, invalid state. Never retried.
    Permanent,
    Io,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Other,
            msg: msg.into(),
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Config,
            msg: msg.into(),
        }
    }

    pub fn transient<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Transient,
            msg: msg.into(),
        }
    }

    pub fn permanent<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_config(&self) -> bool {
        self.kind == ErrorKind::Config
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Prefix the message while keeping the kind.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            msg: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
